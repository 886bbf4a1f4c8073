// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0388 Extensible SASL Profile, with XEP-0386 inline binding.

use core::fmt;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use jid::Jid;
use minidom::Element;
use xmpp_parsers::sm;

use super::bind::BindModule;
use super::sasl::{
    has_usable_mechanism, offered_mechanisms, select_mechanism, BoxedMechanism,
};
use super::stream::StreamFeaturesModule;
use super::{Criteria, ModuleDescriptor, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::{parse, AuthError, Error, ProtocolError};
use crate::event::{AuthEvent, BindEvent, Event};
use crate::ns;
use crate::sm::apply_enabled;
use crate::store::AuthState;

fn decode(element: &Element) -> Result<Vec<u8>, AuthError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Ok(Base64.decode(text)?)
}

fn text_child(name: &str, text: &str) -> Element {
    Element::builder(name, ns::SASL2)
        .append(text.to_owned())
        .build()
}

/// SASL2 authentication.
#[derive(Default)]
pub struct Sasl2Module {
    mechanism: Option<BoxedMechanism>,
    bind_requested: bool,
}

impl fmt::Debug for Sasl2Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Sasl2Module")
            .field("mechanism", &self.mechanism.as_ref().map(|m| m.name()))
            .field("bind_requested", &self.bind_requested)
            .finish()
    }
}

impl Sasl2Module {
    /// Whether the server offers SASL2 on this stream.
    pub fn is_offered(&self, ctx: &Context) -> bool {
        ctx.session.stream_feature("authentication", ns::SASL2).is_some()
    }

    /// Whether the server offers SASL2 with a mechanism we can use.
    pub fn can_login(&self, ctx: &Context) -> bool {
        ctx.session
            .stream_feature("authentication", ns::SASL2)
            .is_some_and(|feature| has_usable_mechanism(ctx.config, feature))
    }

    /// Start authenticating.
    ///
    /// If `bind` is set and the server offers XEP-0386, a resource is bound
    /// (and stream management enabled) as part of the exchange.
    pub fn login(&mut self, ctx: &mut Context, bind: bool) -> Result<(), Error> {
        let feature = ctx
            .session
            .stream_feature("authentication", ns::SASL2)
            .ok_or(AuthError::NoMechanism)?;
        let offered = offered_mechanisms(feature);
        let inline = feature.get_child("inline", ns::SASL2);
        let bind2 = inline.and_then(|inline| inline.get_child("bind", ns::BIND2));
        let inline_sm = bind2
            .and_then(|bind2| bind2.get_child("inline", ns::BIND2))
            .is_some_and(|inline| {
                inline
                    .children()
                    .any(|c| c.is("feature", ns::BIND2) && c.attr("var") == Some(ns::SM))
            });
        let bind_offered = bind2.is_some();

        let mut mechanism = select_mechanism(ctx.config, &offered)?;
        let name = mechanism.name().to_owned();
        let initial = mechanism.initial();

        let mut user_agent = Element::builder("user-agent", ns::SASL2)
            .attr("id", ctx.config.user_agent_id.as_str())
            .append(text_child("software", &ctx.config.software));
        if let Some(device) = ctx.config.device.as_deref() {
            user_agent = user_agent.append(text_child("device", device));
        }

        let mut authenticate = Element::builder("authenticate", ns::SASL2)
            .attr("mechanism", name.as_str())
            .append(user_agent);
        if !initial.is_empty() {
            authenticate = authenticate.append(text_child("initial-response", &Base64.encode(&initial)));
        }

        self.bind_requested = bind && bind_offered;
        if self.bind_requested {
            let mut bind = Element::builder("bind", ns::BIND2)
                .append(Element::builder("tag", ns::BIND2).append(ctx.config.software.clone()));
            if inline_sm && ctx.config.stream_management {
                let mut enable = sm::Enable::new().with_resume();
                if let Some(max) = ctx.config.sm_max {
                    enable = enable.with_max(max);
                }
                bind = bind.append(Element::from(enable));
            }
            authenticate = authenticate.append(bind);
        }

        log::debug!(
            "starting SASL2 authentication with {} (inline bind: {})",
            name,
            self.bind_requested
        );
        ctx.session.set_auth_state(AuthState::InProgress);
        ctx.fire(Event::Authentication(AuthEvent::Started { mechanism: name }));
        ctx.write_directly(authenticate.build());
        self.mechanism = Some(mechanism);
        Ok(())
    }

    fn fail(&mut self, ctx: &mut Context, error: AuthError) {
        log::warn!("SASL2 authentication failed: {}", error);
        self.mechanism = None;
        self.bind_requested = false;
        ctx.session.set_auth_state(AuthState::Error);
        ctx.fire(Event::Authentication(AuthEvent::Failed(error)));
    }

    fn on_challenge(&mut self, ctx: &mut Context, element: &Element) {
        let Some(mechanism) = self.mechanism.as_mut() else {
            log::warn!("SASL2 challenge without an exchange in progress");
            return;
        };
        let response = decode(element).and_then(|data| Ok(mechanism.response(&data)?));
        match response {
            Ok(data) => {
                ctx.write_directly(text_child("response", &Base64.encode(&data)));
            }
            Err(e) => self.fail(ctx, e),
        }
    }

    fn on_success(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        let Some(mut mechanism) = self.mechanism.take() else {
            log::warn!("SASL2 success without an exchange in progress");
            return Ok(());
        };
        let additional = match element.get_child("additional-data", ns::SASL2) {
            Some(data) => decode(data),
            None => Ok(Vec::new()),
        };
        if let Err(e) = additional.and_then(|data| Ok(mechanism.success(&data)?)) {
            self.fail(ctx, e);
            return Ok(());
        }

        let authorized = element
            .get_child("authorization-identifier", ns::SASL2)
            .ok_or(ProtocolError::MissingAttribute {
                element: "success",
                attribute: "authorization-identifier",
            })?;
        let jid = Jid::new(authorized.text().trim())?;
        let bound = element.get_child("bound", ns::BIND2);
        let inline_bound = self.bind_requested && !jid.is_bare();
        self.bind_requested = false;

        log::debug!("SASL2 authentication succeeded as {}", jid);
        ctx.session.set_auth_state(AuthState::Success);
        ctx.fire(Event::Authentication(AuthEvent::Success {
            restart_required: false,
            inline_bound,
        }));

        if inline_bound {
            if let Some(enabled) = bound.and_then(|bound| bound.get_child("enabled", ns::SM)) {
                apply_enabled(ctx, parse(enabled)?);
            } else if let Some(failed) = bound.and_then(|bound| bound.get_child("failed", ns::SM)) {
                log::info!(
                    "inline stream management failed: {:?}",
                    failed.children().map(Element::name).collect::<Vec<_>>()
                );
            }
            ctx.fire(Event::Bind(BindEvent::Success { jid, inline: true }));
        }
        Ok(())
    }

    fn on_failure(&mut self, ctx: &mut Context, element: &Element) {
        let condition = element
            .children()
            .find(|child| child.has_ns(ns::SASL) && child.name() != "text")
            .map_or("undefined-condition", Element::name);
        self.fail(ctx, AuthError::Sasl2Fail(condition.to_owned()));
    }
}

impl XmppModule for Sasl2Module {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::xmlns(ns::SASL2))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        match element.name() {
            "challenge" => self.on_challenge(ctx, element),
            "success" => self.on_success(ctx, element)?,
            "failure" => self.on_failure(ctx, element),
            "continue" => {
                // Tasks (e.g. password upgrades) are not implemented.
                self.fail(ctx, AuthError::Sasl2Fail(String::from("continue")));
            }
            other => return Err(ProtocolError::UnexpectedElement(other.to_owned()).into()),
        }
        Ok(())
    }
}

impl ModuleProvider for Sasl2Module {
    const NAME: &'static str = "sasl2";

    fn requires() -> Vec<fn() -> ModuleDescriptor> {
        vec![
            ModuleDescriptor::new::<StreamFeaturesModule>,
            ModuleDescriptor::new::<BindModule>,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamManagementEvent;
    use crate::testutil::{parse, Harness};

    const FEATURES: &str = "<features xmlns='http://etherx.jabber.org/streams'>\
        <authentication xmlns='urn:xmpp:sasl:2'>\
          <mechanism>PLAIN</mechanism>\
          <inline>\
            <bind xmlns='urn:xmpp:bind:0'><inline><feature var='urn:xmpp:sm:3'/></inline></bind>\
          </inline>\
        </authentication>\
      </features>";

    fn started() -> (Harness, Sasl2Module, Element) {
        let mut harness = Harness::new();
        harness.session.set_stream_features(parse(FEATURES));
        let mut module = Sasl2Module::default();
        assert!(module.is_offered(&harness.context()));
        module.login(&mut harness.context(), true).unwrap();
        let mut sent = harness.sent();
        assert_eq!(sent.len(), 1);
        harness.events();
        (harness, module, sent.remove(0))
    }

    #[test]
    fn authenticate_carries_inline_bind() {
        let (_, _, authenticate) = started();
        assert!(authenticate.is("authenticate", ns::SASL2));
        assert_eq!(authenticate.attr("mechanism"), Some("PLAIN"));
        let initial = authenticate.get_child("initial-response", ns::SASL2).unwrap();
        assert_eq!(Base64.decode(initial.text()).unwrap(), b"\0juliet\0secret");
        let user_agent = authenticate.get_child("user-agent", ns::SASL2).unwrap();
        assert_eq!(user_agent.get_child("software", ns::SASL2).unwrap().text(), "xmpp-session");
        let bind = authenticate.get_child("bind", ns::BIND2).unwrap();
        assert!(bind.get_child("enable", ns::SM).is_some());
    }

    #[test]
    fn success_with_inline_bind() {
        let (mut harness, mut module, _) = started();
        module
            .process(
                &mut harness.context(),
                &parse("<success xmlns='urn:xmpp:sasl:2'>\
                    <authorization-identifier>juliet@capulet.lit/balcony-1</authorization-identifier>\
                    <bound xmlns='urn:xmpp:bind:0'><enabled xmlns='urn:xmpp:sm:3' id='sm-2' resume='true'/></bound>\
                  </success>"),
            )
            .unwrap();
        assert_eq!(harness.session.auth_state(), AuthState::Success);
        let events = harness.events();
        assert!(matches!(
            events.as_slice(),
            [
                Event::Authentication(AuthEvent::Success { restart_required: false, inline_bound: true }),
                Event::StreamManagement(StreamManagementEvent::Enabled { resume: true, .. }),
                Event::Bind(BindEvent::Success { inline: true, .. }),
            ]
        ));
        assert_eq!(harness.stream_restarts(), 0);
    }

    #[test]
    fn failure_names_condition() {
        let (mut harness, mut module, _) = started();
        module
            .process(
                &mut harness.context(),
                &parse("<failure xmlns='urn:xmpp:sasl:2'><aborted xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/><text>This is a terrible example.</text></failure>"),
            )
            .unwrap();
        assert_eq!(harness.session.auth_state(), AuthState::Error);
        assert!(matches!(
            harness.events().as_slice(),
            [Event::Authentication(AuthEvent::Failed(AuthError::Sasl2Fail(condition)))] if condition == "aborted"
        ));
    }

    #[test]
    fn no_inline_bind_when_resuming() {
        let mut harness = Harness::new();
        harness.session.set_stream_features(parse(FEATURES));
        let mut module = Sasl2Module::default();
        module.login(&mut harness.context(), false).unwrap();
        let sent = harness.sent();
        assert!(sent[0].get_child("bind", ns::BIND2).is_none());
    }
}
