// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0030 service discovery (info only).

use jid::Jid;
use minidom::Element;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use super::{reply_to, Criteria, ModulesManager, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::ns;
use crate::requests::RequestHandle;

fn features_of(reply: Element) -> Result<Vec<String>, ProtocolError> {
    let query = reply
        .get_child("query", ns::DISCO_INFO)
        .ok_or_else(|| ProtocolError::UnexpectedElement(reply.name().to_owned()))?;
    Ok(query
        .children()
        .filter(|child| child.is("feature", ns::DISCO_INFO))
        .filter_map(|child| child.attr("var"))
        .map(ToOwned::to_owned)
        .collect())
}

/// Queries and answers `disco#info`.
///
/// Our own feature list is the union of the features of all installed
/// modules, collected once every module is registered.
#[derive(Debug, Default)]
pub struct DiscoveryModule {
    features: Vec<&'static str>,
}

impl DiscoveryModule {
    /// Features we advertise.
    pub fn features(&self) -> &[&'static str] {
        &self.features
    }

    /// Ask `jid` for its features. The result is published as
    /// [`Event::Discovery`].
    pub fn info(&mut self, ctx: &mut Context, jid: Jid) -> RequestHandle {
        let events = ctx.event_sender();
        let target = jid.clone();
        ctx.request()
            .iq_get(Some(jid), Element::builder("query", ns::DISCO_INFO).build())
            .name("disco#info")
            .try_map(features_of)
            .response(move |result| match result {
                Ok(features) => events.fire(Event::Discovery {
                    jid: target,
                    features,
                }),
                Err(e) => log::debug!("disco#info on {} failed: {}", target, e),
            })
            .send(ctx)
    }
}

impl XmppModule for DiscoveryModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::stanza_with("iq", ns::DISCO_INFO))
    }

    fn features(&self) -> Vec<&'static str> {
        vec![ns::DISCO_INFO]
    }

    fn initialize(&mut self, _ctx: &mut Context, modules: &ModulesManager) -> Result<(), Error> {
        self.features = modules.available_features();
        Ok(())
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        if element.attr("type") != Some("get") {
            return Err(StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::FeatureNotImplemented,
                "en",
                "Only disco#info queries are supported.",
            )
            .into());
        }
        let identity = Element::builder("identity", ns::DISCO_INFO)
            .attr("category", "client")
            .attr("type", "pc")
            .attr("name", ctx.config.software.as_str());
        let query = Element::builder("query", ns::DISCO_INFO)
            .append(identity)
            .append_all(self.features.iter().map(|feature| {
                Element::builder("feature", ns::DISCO_INFO).attr("var", *feature)
            }));
        ctx.write_directly(reply_to(element, "result").append(query).build());
        Ok(())
    }
}

impl ModuleProvider for DiscoveryModule {
    const NAME: &'static str = "disco";
}
