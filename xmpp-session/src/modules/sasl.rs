// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 6120 SASL authentication.

use core::fmt;

use minidom::Element;
use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::Credentials;
use xmpp_parsers::sasl::{Auth, Challenge, Failure, Mechanism as XMPPMechanism, Response, Success};

use super::stream::StreamFeaturesModule;
use super::{Criteria, ModuleDescriptor, ModuleProvider, XmppModule};
use crate::config::Config;
use crate::context::Context;
use crate::error::{parse, AuthError, Error, ProtocolError};
use crate::event::{AuthEvent, Event};
use crate::ns;
use crate::store::AuthState;

pub(crate) type BoxedMechanism = Box<dyn Mechanism + Send>;

/// Pick the strongest local mechanism the server offers.
///
/// Without a password only ANONYMOUS is considered.
pub(crate) fn select_mechanism(
    config: &Config,
    offered: &[String],
) -> Result<BoxedMechanism, AuthError> {
    let offers = |name: &str| offered.iter().any(|m| m == name);

    let Some(password) = config.password.as_ref() else {
        if offers("ANONYMOUS") {
            return Ok(Box::new(Anonymous::new()));
        }
        return Err(AuthError::NoMechanism);
    };
    let Some(username) = config.jid.node() else {
        return Err(AuthError::NoMechanism);
    };
    let creds = Credentials::default()
        .with_username(username.as_str())
        .with_password(password.as_str());

    if offers("SCRAM-SHA-256") {
        return Ok(Box::new(Scram::<Sha256>::from_credentials(creds)?));
    }
    if offers("SCRAM-SHA-1") {
        return Ok(Box::new(Scram::<Sha1>::from_credentials(creds)?));
    }
    if offers("PLAIN") {
        return Ok(Box::new(Plain::from_credentials(creds)?));
    }
    Err(AuthError::NoMechanism)
}

/// Whether `feature` lists a mechanism which works with `config`.
pub(crate) fn has_usable_mechanism(config: &Config, feature: &Element) -> bool {
    select_mechanism(config, &offered_mechanisms(feature)).is_ok()
}

/// Mechanism names listed in `<mechanism/>` children of `feature`.
pub(crate) fn offered_mechanisms(feature: &Element) -> Vec<String> {
    feature
        .children()
        .filter(|child| child.name() == "mechanism")
        .map(Element::text)
        .collect()
}

fn wire_mechanism(name: &str) -> Option<XMPPMechanism> {
    Some(match name {
        "SCRAM-SHA-256" => XMPPMechanism::ScramSha256,
        "SCRAM-SHA-1" => XMPPMechanism::ScramSha1,
        "PLAIN" => XMPPMechanism::Plain,
        "ANONYMOUS" => XMPPMechanism::Anonymous,
        _ => return None,
    })
}

/// Legacy SASL authentication.
#[derive(Default)]
pub struct SaslModule {
    mechanism: Option<BoxedMechanism>,
}

impl fmt::Debug for SaslModule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SaslModule")
            .field("mechanism", &self.mechanism.as_ref().map(|m| m.name()))
            .finish()
    }
}

impl SaslModule {
    /// Whether the server offers SASL on this stream.
    pub fn is_offered(&self, ctx: &Context) -> bool {
        ctx.session.stream_feature("mechanisms", ns::SASL).is_some()
    }

    /// Whether the server offers SASL with a mechanism we can use.
    pub fn can_login(&self, ctx: &Context) -> bool {
        ctx.session
            .stream_feature("mechanisms", ns::SASL)
            .is_some_and(|feature| has_usable_mechanism(ctx.config, feature))
    }

    /// Start authenticating with the best mechanism the server offers.
    pub fn login(&mut self, ctx: &mut Context) -> Result<(), Error> {
        let offered = ctx
            .session
            .stream_feature("mechanisms", ns::SASL)
            .map(offered_mechanisms)
            .unwrap_or_default();
        let mut mechanism = select_mechanism(ctx.config, &offered)?;
        let wire = wire_mechanism(mechanism.name()).ok_or(AuthError::NoMechanism)?;
        let name = mechanism.name().to_owned();
        let data = mechanism.initial();

        log::debug!("starting SASL authentication with {}", name);
        ctx.session.set_auth_state(AuthState::InProgress);
        ctx.fire(Event::Authentication(AuthEvent::Started { mechanism: name }));
        ctx.write_directly(
            Auth {
                mechanism: wire,
                data,
            }
            .into(),
        );
        self.mechanism = Some(mechanism);
        Ok(())
    }

    fn fail(&mut self, ctx: &mut Context, error: AuthError) {
        log::warn!("SASL authentication failed: {}", error);
        self.mechanism = None;
        ctx.session.set_auth_state(AuthState::Error);
        ctx.fire(Event::Authentication(AuthEvent::Failed(error)));
    }

    fn on_challenge(&mut self, ctx: &mut Context, challenge: Challenge) {
        let Some(mechanism) = self.mechanism.as_mut() else {
            log::warn!("SASL challenge without an exchange in progress");
            return;
        };
        match mechanism.response(&challenge.data) {
            Ok(data) => {
                ctx.write_directly(Response { data }.into());
            }
            Err(e) => self.fail(ctx, e.into()),
        }
    }

    fn on_success(&mut self, ctx: &mut Context, success: Success) {
        let Some(mut mechanism) = self.mechanism.take() else {
            log::warn!("SASL success without an exchange in progress");
            return;
        };
        if let Err(e) = mechanism.success(&success.data) {
            // The server could not prove it knows our credentials.
            self.fail(ctx, e.into());
            return;
        }
        log::debug!("SASL authentication succeeded");
        ctx.session.set_auth_state(AuthState::Success);
        ctx.restart_stream();
        ctx.fire(Event::Authentication(AuthEvent::Success {
            restart_required: true,
            inline_bound: false,
        }));
    }
}

impl XmppModule for SaslModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::xmlns(ns::SASL))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        match element.name() {
            "challenge" => self.on_challenge(ctx, parse(element)?),
            "success" => self.on_success(ctx, parse(element)?),
            "failure" => {
                let failure: Failure = parse(element)?;
                self.fail(ctx, AuthError::Fail(failure.defined_condition));
            }
            other => return Err(ProtocolError::UnexpectedElement(other.to_owned()).into()),
        }
        Ok(())
    }
}

impl ModuleProvider for SaslModule {
    const NAME: &'static str = "sasl";

    fn requires() -> Vec<fn() -> ModuleDescriptor> {
        vec![ModuleDescriptor::new::<StreamFeaturesModule>]
    }
}
