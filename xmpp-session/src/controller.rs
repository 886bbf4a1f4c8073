// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session bootstrap.
//!
//! The [`SessionController`] reacts to events published by the modules and
//! decides what happens next: authenticate, register, bind or resume. It
//! never retries anything by itself; failures are classified into
//! [`SessionControllerEvent::ErrorStop`] and
//! [`SessionControllerEvent::ErrorReconnect`] for whoever supervises the
//! connection.

use jid::Jid;

use crate::context::Context;
use crate::error::Error;
use crate::event::{
    AuthEvent, BindEvent, ConnectorState, Event, RegistrationEvent, SessionControllerEvent,
    StreamManagementEvent,
};
use crate::modules::bind::BindModule;
use crate::modules::disco::DiscoveryModule;
use crate::modules::presence::PresenceModule;
use crate::modules::register::{InBandRegistrationModule, RegistrationForm};
use crate::modules::roster::RosterModule;
use crate::modules::sasl::SaslModule;
use crate::modules::sasl2::Sasl2Module;
use crate::modules::ModulesManager;
use crate::sm::StreamManagementModule;
use crate::store::{AuthState, Scope};

fn stop(ctx: &Context, message: String) {
    log::error!("session stopped: {}", message);
    ctx.fire(Event::Session(SessionControllerEvent::ErrorStop(message)));
}

fn reconnect(ctx: &Context, message: String, immediately: bool, force: bool) {
    log::warn!("session needs a new connection: {}", message);
    ctx.fire(Event::Session(SessionControllerEvent::ErrorReconnect {
        message,
        immediately,
        force,
    }));
}

/// Drives authentication, binding and resumption from events.
#[derive(Debug, Default)]
pub(crate) struct SessionController {
    registered: bool,
    resuming: bool,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(
        &mut self,
        ctx: &mut Context,
        modules: &mut ModulesManager,
        event: &Event,
    ) -> Result<(), Error> {
        match event {
            Event::StreamFeaturesReceived => match ctx.session.auth_state() {
                AuthState::Unknown => self.on_unauthenticated_features(ctx, modules)?,
                AuthState::Success => self.resume_or_bind(ctx, modules)?,
                AuthState::InProgress | AuthState::Error => {
                    log::debug!("ignoring stream features during authentication");
                }
            },
            Event::Authentication(AuthEvent::Success {
                restart_required: false,
                inline_bound,
            }) => {
                // After an inline bind the bind event follows.
                if !inline_bound {
                    self.resume_or_bind(ctx, modules)?;
                }
            }
            Event::Authentication(AuthEvent::Failed(error)) => {
                stop(ctx, format!("Authentication error: {}", error));
            }
            Event::Bind(BindEvent::Success { jid, inline }) => {
                Self::on_bound(ctx, modules, jid, *inline)?;
            }
            Event::Bind(BindEvent::Failed(error)) => {
                log::warn!("binding failed: {}", error);
                reconnect(ctx, String::from("Session bind error"), false, false);
            }
            Event::StreamManagement(StreamManagementEvent::Resumed { .. }) => {
                self.resuming = false;
                ctx.fire(Event::Session(SessionControllerEvent::Successful));
            }
            Event::StreamManagement(StreamManagementEvent::Failed(_)) if self.resuming => {
                self.resuming = false;
                // Nothing sent on the old session will be answered.
                ctx.requests.timeout_all(None);
                ctx.session.clear(Scope::Session);
                modules.require_mut::<BindModule>()?.bind(ctx);
            }
            Event::Registration(event) => self.on_registration(ctx, modules, event)?,
            Event::ParseError(message) => {
                log::warn!("parse error: {}", message);
                reconnect(ctx, String::from("Parse error"), false, false);
            }
            Event::StreamError {
                condition,
                see_other_host,
                ..
            } => {
                ctx.session.clear(Scope::Connection);
                let redirected = see_other_host.is_some();
                reconnect(
                    ctx,
                    format!("Stream error: {}", condition),
                    redirected,
                    redirected,
                );
            }
            Event::ConnectorStateChanged { old, new } => {
                Self::on_connector_state(ctx, modules, *old, *new)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_unauthenticated_features(
        &mut self,
        ctx: &mut Context,
        modules: &mut ModulesManager,
    ) -> Result<(), Error> {
        let resumable = modules
            .require_mut::<StreamManagementModule>()?
            .is_resumption_available(ctx);
        if !resumable {
            let sm = modules.require_mut::<StreamManagementModule>()?;
            sm.reset(ctx);
        }

        let result = if modules.require_mut::<Sasl2Module>()?.can_login(ctx) {
            // A resumed session keeps its resource, so nothing is bound
            // inline.
            modules.require_mut::<Sasl2Module>()?.login(ctx, !resumable)
        } else if modules.require_mut::<SaslModule>()?.can_login(ctx) {
            modules.require_mut::<SaslModule>()?.login(ctx)
        } else if self.can_register(ctx, modules)? {
            log::info!("registering account {}", ctx.config.jid);
            modules
                .require_mut::<InBandRegistrationModule>()?
                .request_form(ctx);
            Ok(())
        } else {
            stop(
                ctx,
                String::from("No supported authentication or registration method"),
            );
            Ok(())
        };

        match result {
            Err(Error::Auth(error)) => {
                stop(ctx, format!("Authentication error: {}", error));
                Ok(())
            }
            other => other,
        }
    }

    fn can_register(&self, ctx: &Context, modules: &mut ModulesManager) -> Result<bool, Error> {
        if self.registered || ctx.config.registration.is_none() {
            return Ok(false);
        }
        Ok(modules
            .require_mut::<InBandRegistrationModule>()?
            .is_offered(ctx))
    }

    fn resume_or_bind(
        &mut self,
        ctx: &mut Context,
        modules: &mut ModulesManager,
    ) -> Result<(), Error> {
        let sm = modules.require_mut::<StreamManagementModule>()?;
        if sm.is_resumption_available(ctx) {
            self.resuming = sm.resume(ctx);
        } else if ctx.session.can_bind() {
            modules.require_mut::<BindModule>()?.bind(ctx);
        } else {
            log::warn!("server offers neither resumption nor resource binding");
        }
        Ok(())
    }

    fn on_bound(
        ctx: &mut Context,
        modules: &mut ModulesManager,
        jid: &Jid,
        inline: bool,
    ) -> Result<(), Error> {
        log::info!("bound as {}", jid);
        ctx.session.set_bound_jid(jid.clone());
        ctx.requests.set_bound_jid(Some(jid.clone()));

        let server = Jid::new(jid.domain().as_str())?;
        let account = Jid::from(jid.to_bare());
        if let Some(disco) = modules.get_mut::<DiscoveryModule>() {
            disco.info(ctx, server);
            disco.info(ctx, account);
        }
        if let Some(presence) = modules.get_mut::<PresenceModule>() {
            presence.send_initial_presence(ctx);
        }
        if let Some(roster) = modules.get_mut::<RosterModule>() {
            roster.request_roster(ctx);
        }
        if !inline {
            modules.require_mut::<StreamManagementModule>()?.enable(ctx);
        }
        ctx.fire(Event::Session(SessionControllerEvent::Successful));
        Ok(())
    }

    fn on_registration(
        &mut self,
        ctx: &mut Context,
        modules: &mut ModulesManager,
        event: &RegistrationEvent,
    ) -> Result<(), Error> {
        match event {
            RegistrationEvent::FormReceived(form) => {
                let form = self.fill_form(ctx, form.clone());
                modules
                    .require_mut::<InBandRegistrationModule>()?
                    .submit(ctx, &form);
            }
            RegistrationEvent::Completed => {
                log::info!("account {} registered", ctx.config.jid);
                self.registered = true;
                // The account exists now; log in on a fresh connection.
                ctx.close();
            }
            RegistrationEvent::Failed(error) => {
                stop(ctx, format!("Registration error: {}", error));
            }
        }
        Ok(())
    }

    fn fill_form(&self, ctx: &Context, mut form: RegistrationForm) -> RegistrationForm {
        if let Some(node) = ctx.config.jid.node() {
            form.set("username", node.as_str());
        }
        if let Some(password) = ctx.config.password.as_deref() {
            form.set("password", password);
        }
        if let Some(registration) = ctx.config.registration.as_ref() {
            registration.fill(&mut form);
        }
        form
    }

    fn on_connector_state(
        ctx: &mut Context,
        modules: &mut ModulesManager,
        old: ConnectorState,
        new: ConnectorState,
    ) -> Result<(), Error> {
        let sm = modules.require_mut::<StreamManagementModule>()?;
        match new {
            ConnectorState::Disconnecting => {
                // Closing the stream ends the stream management session.
                ctx.requests.timeout_all(None);
                sm.reset(ctx);
            }
            ConnectorState::Disconnected => {
                let clean = old == ConnectorState::Disconnecting;
                if clean || !sm.is_resumption_available(ctx) {
                    ctx.requests.timeout_all(None);
                    sm.reset(ctx);
                    ctx.session.clear(Scope::Session);
                    ctx.requests.set_bound_jid(Some(ctx.config.jid.clone()));
                } else {
                    log::debug!("connection lost, keeping the session for resumption");
                    sm.deactivate(ctx);
                    ctx.session.clear(Scope::Connection);
                }
            }
            ConnectorState::Connecting | ConnectorState::Connected => {}
        }
        Ok(())
    }
}
