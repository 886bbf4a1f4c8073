// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Initial and incoming presence.

use minidom::Element;

use super::{Criteria, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::Error;
use crate::event::Event;
use crate::ns;
use crate::requests::RequestHandle;

/// Publishes incoming presence and sends our own.
#[derive(Debug, Default)]
pub struct PresenceModule;

impl PresenceModule {
    /// Broadcast available presence.
    pub fn send_initial_presence(&mut self, ctx: &mut Context) -> RequestHandle {
        ctx.request()
            .presence(Element::builder("presence", ns::JABBER_CLIENT).build())
            .name("initial presence")
            .send(ctx)
    }
}

impl XmppModule for PresenceModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::name_and_xmlns("presence", ns::JABBER_CLIENT))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        ctx.fire(Event::Presence(element.clone()));
        Ok(())
    }
}

impl ModuleProvider for PresenceModule {
    const NAME: &'static str = "presence";
}
