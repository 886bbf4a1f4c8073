// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream-level elements: `<stream:features/>` and `<stream:error/>`.

use minidom::Element;

use super::{Criteria, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::Error;
use crate::event::Event;
use crate::ns;

/// Stores received stream features in the session.
#[derive(Debug, Default)]
pub struct StreamFeaturesModule;

impl XmppModule for StreamFeaturesModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::name_and_xmlns("features", ns::STREAM))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        log::debug!(
            "received stream features: {:?}",
            element.children().map(Element::name).collect::<Vec<_>>()
        );
        ctx.session.set_stream_features(element.clone());
        ctx.fire(Event::StreamFeaturesReceived);
        Ok(())
    }
}

impl ModuleProvider for StreamFeaturesModule {
    const NAME: &'static str = "stream-features";
}

/// Turns `<stream:error/>` into [`Event::StreamError`].
#[derive(Debug, Default)]
pub struct StreamErrorModule;

impl XmppModule for StreamErrorModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::name_and_xmlns("error", ns::STREAM))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        let mut condition = String::from("undefined-condition");
        let mut text = None;
        let mut see_other_host = None;
        for child in element.children().filter(|c| c.has_ns(ns::XMPP_STREAMS)) {
            match child.name() {
                "text" => text = Some(child.text()),
                "see-other-host" => {
                    see_other_host = Some(child.text());
                    condition = String::from("see-other-host");
                }
                name => condition = name.to_owned(),
            }
        }
        log::warn!("stream error {}: {:?}", condition, text);
        ctx.fire(Event::StreamError {
            condition,
            text,
            see_other_host,
        });
        Ok(())
    }
}

impl ModuleProvider for StreamErrorModule {
    const NAME: &'static str = "stream-error";
}

/// Build a `<stream:error/>` with the given condition.
pub(crate) fn stream_error(condition: &str) -> Element {
    Element::builder("error", ns::STREAM)
        .append(Element::builder(condition, ns::XMPP_STREAMS))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{parse, Harness};

    #[test]
    fn features_are_stored() {
        let mut harness = Harness::new();
        StreamFeaturesModule
            .process(
                &mut harness.context(),
                &parse("<stream:features xmlns:stream='http://etherx.jabber.org/streams'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>"),
            )
            .unwrap();
        assert!(harness.session.can_bind());
        assert!(matches!(harness.events().as_slice(), [Event::StreamFeaturesReceived]));
    }

    #[test]
    fn see_other_host() {
        let mut harness = Harness::new();
        StreamErrorModule
            .process(
                &mut harness.context(),
                &parse("<stream:error xmlns:stream='http://etherx.jabber.org/streams'><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>[2001:41D0:1:A49b::1]:9222</see-other-host></stream:error>"),
            )
            .unwrap();
        assert!(matches!(
            harness.events().as_slice(),
            [Event::StreamError { condition, text: None, see_other_host: Some(host) }]
                if condition == "see-other-host" && host == "[2001:41D0:1:A49b::1]:9222"
        ));
    }

    #[test]
    fn condition_and_text() {
        let mut harness = Harness::new();
        StreamErrorModule
            .process(
                &mut harness.context(),
                &parse("<stream:error xmlns:stream='http://etherx.jabber.org/streams'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/><text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced by new connection</text></stream:error>"),
            )
            .unwrap();
        assert!(matches!(
            harness.events().as_slice(),
            [Event::StreamError { condition, text: Some(text), see_other_host: None }]
                if condition == "conflict" && text == "Replaced by new connection"
        ));
    }
}
