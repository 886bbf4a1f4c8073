// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 6120 resource binding.

use jid::Jid;
use minidom::Element;
use xmpp_parsers::bind::{BindQuery, BindResponse};

use super::stream::StreamFeaturesModule;
use super::{ModuleDescriptor, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::ProtocolError;
use crate::event::{BindEvent, Event};
use crate::ns;
use crate::requests::RequestHandle;

fn bound_jid(reply: Element) -> Result<Jid, ProtocolError> {
    let payload = reply
        .get_child("bind", ns::BIND)
        .ok_or(ProtocolError::InvalidBindResponse)?;
    match BindResponse::try_from(payload.clone()) {
        Ok(response) => Ok(response.into()),
        Err(_) => Err(ProtocolError::InvalidBindResponse),
    }
}

/// Binds a resource after authentication.
#[derive(Debug, Default)]
pub struct BindModule;

impl BindModule {
    /// Ask the server to bind the resource of the configured JID, or one of
    /// its choosing. The outcome is published as [`Event::Bind`].
    pub fn bind(&mut self, ctx: &mut Context) -> RequestHandle {
        let resource = ctx.config.jid.resource().map(|resource| resource.to_string());
        let events = ctx.event_sender();
        log::debug!("binding resource {:?}", resource);
        ctx.request()
            .iq_set(None, BindQuery::new(resource).into())
            .name("bind")
            .try_map(bound_jid)
            .response(move |result| {
                let event = match result {
                    Ok(jid) => BindEvent::Success { jid, inline: false },
                    Err(error) => BindEvent::Failed(error),
                };
                events.fire(Event::Bind(event));
            })
            .send(ctx)
    }
}

impl XmppModule for BindModule {}

impl ModuleProvider for BindModule {
    const NAME: &'static str = "bind";

    fn requires() -> Vec<fn() -> ModuleDescriptor> {
        vec![ModuleDescriptor::new::<StreamFeaturesModule>]
    }
}
