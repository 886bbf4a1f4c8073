// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;

use tokio::time::Instant;

use minidom::Element;

use crate::config::Config;
use crate::event::{Event, EventBus, EventSender};
use crate::requests::{Request, RequestBuilderFactory, RequestWriter, RequestsManager};
use crate::sm::{QueueEntry, StanzaToken};
use crate::store::SessionObject;

/// Something waiting to be handed to the transport.
pub(crate) enum Outgoing {
    /// An element, with the request it belongs to if it was written
    /// through [`RequestWriter::write`].
    Element {
        entry: QueueEntry,
        request: Option<Request>,
    },
    /// Restart the stream (after SASL success).
    RestartStream,
    /// Close the stream.
    Close,
}

/// Elements written by modules, in write order.
#[derive(Default)]
pub(crate) struct Outbox {
    items: VecDeque<Outgoing>,
}

impl Outbox {
    pub fn push(&mut self, item: Outgoing) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<Outgoing> {
        self.items.pop_front()
    }
}

/// Everything a module may touch while it handles an element or an event.
///
/// Writes are buffered and handed to the transport in order once the module
/// returns.
pub struct Context<'a> {
    pub(crate) session: &'a mut SessionObject,
    pub(crate) requests: &'a mut RequestsManager,
    pub(crate) outbox: &'a mut Outbox,
    pub(crate) events: &'a EventBus,
    pub(crate) config: &'a Config,
    pub(crate) now: Instant,
}

impl<'a> Context<'a> {
    /// Session properties.
    pub fn session(&self) -> &SessionObject {
        self.session
    }

    /// Mutable session properties.
    pub fn session_mut(&mut self) -> &mut SessionObject {
        self.session
    }

    /// Client configuration.
    pub fn config(&self) -> &Config {
        self.config
    }

    /// Time at which the current step started.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Publish an event.
    pub fn fire(&self, event: Event) {
        self.events.fire(event);
    }

    /// A handle to publish events from response handlers.
    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    /// Factory for requests with the configured default timeout.
    pub fn request(&self) -> RequestBuilderFactory {
        RequestBuilderFactory::new(self.config.request_timeout)
    }

    /// Send an element without tracking a reply.
    pub fn write_directly(&mut self, element: Element) -> StanzaToken {
        let (entry, token) = QueueEntry::tracked(element);
        self.outbox.push(Outgoing::Element {
            entry,
            request: None,
        });
        token
    }

    /// Restart the stream once everything written so far was sent.
    pub fn restart_stream(&mut self) {
        self.outbox.push(Outgoing::RestartStream);
    }

    /// Close the stream once everything written so far was sent.
    pub fn close(&mut self) {
        self.outbox.push(Outgoing::Close);
    }

    pub(crate) fn resend(&mut self, entry: QueueEntry) {
        self.outbox.push(Outgoing::Element {
            entry,
            request: None,
        });
    }
}

impl RequestWriter for Context<'_> {
    fn write(&mut self, request: Request) -> StanzaToken {
        let (entry, token) = QueueEntry::tracked(request.stanza().clone());
        self.outbox.push(Outgoing::Element {
            entry,
            request: Some(request),
        });
        token
    }
}
