// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 6121 roster retrieval and pushes.
//!
//! Roster storage is left to the application; every roster result and push
//! is published as [`Event::Roster`] with the `<query/>` payload.

use jid::Jid;
use minidom::Element;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use super::{reply_to, Criteria, ModuleProvider, XmppModule};
use crate::context::Context;
use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::ns;
use crate::requests::RequestHandle;

fn roster_query(reply: Element) -> Result<Element, ProtocolError> {
    reply
        .get_child("query", ns::ROSTER)
        .cloned()
        .ok_or_else(|| ProtocolError::UnexpectedElement(reply.name().to_owned()))
}

/// Fetches the roster and acknowledges roster pushes.
#[derive(Debug, Default)]
pub struct RosterModule;

impl RosterModule {
    /// Request the roster.
    pub fn request_roster(&mut self, ctx: &mut Context) -> RequestHandle {
        let events = ctx.event_sender();
        ctx.request()
            .iq_get(None, Element::builder("query", ns::ROSTER).build())
            .name("roster")
            .try_map(roster_query)
            .response(move |result| match result {
                Ok(query) => events.fire(Event::Roster(query)),
                Err(e) => log::warn!("roster request failed: {}", e),
            })
            .send(ctx)
    }
}

impl XmppModule for RosterModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::stanza_with("iq", ns::ROSTER))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        if element.attr("type") != Some("set") {
            return Err(StanzaError::new(
                ErrorType::Cancel,
                DefinedCondition::BadRequest,
                "en",
                "Only roster pushes are accepted.",
            )
            .into());
        }
        // Pushes must come from our own account.
        if let Some(from) = element.attr("from") {
            let from = Jid::new(from)?;
            let own = ctx.session.bound_jid().map(Jid::to_bare);
            if own.as_ref() != Some(&from.to_bare()) {
                log::warn!("ignoring roster push from {}", from);
                return Err(StanzaError::new(
                    ErrorType::Cancel,
                    DefinedCondition::ServiceUnavailable,
                    "en",
                    "Roster pushes are only accepted from the own account.",
                )
                .into());
            }
        }
        let query = roster_query(element.clone())?;
        ctx.write_directly(reply_to(element, "result").build());
        ctx.fire(Event::Roster(query));
        Ok(())
    }
}

impl ModuleProvider for RosterModule {
    const NAME: &'static str = "roster";
}
