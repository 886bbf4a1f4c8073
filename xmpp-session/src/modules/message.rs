// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Chat messages.

use jid::Jid;
use minidom::Element;

use super::{Criteria, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::Error;
use crate::event::Event;
use crate::ns;
use crate::requests::RequestHandle;

/// Publishes incoming messages and sends chat messages.
#[derive(Debug, Default)]
pub struct MessageModule;

impl MessageModule {
    /// Send a chat message with a plain-text body.
    pub fn send_chat(&mut self, ctx: &mut Context, to: &Jid, body: &str) -> RequestHandle {
        let message = Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", "chat")
            .attr("to", to.to_string())
            .append(Element::builder("body", ns::JABBER_CLIENT).append(body.to_owned()))
            .build();
        ctx.request().message(message).send(ctx)
    }
}

impl XmppModule for MessageModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::name_and_xmlns("message", ns::JABBER_CLIENT))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        ctx.fire(Event::Message(element.clone()));
        Ok(())
    }
}

impl ModuleProvider for MessageModule {
    const NAME: &'static str = "message";
}
