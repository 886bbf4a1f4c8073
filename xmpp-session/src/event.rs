// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use rand::{thread_rng, Rng};
use tokio::sync::mpsc;

use jid::Jid;
use minidom::Element;
use xmpp_parsers::stanza_error::DefinedCondition;

use crate::error::AuthError;
use crate::modules::register::RegistrationForm;
use crate::requests::RequestError;

pub(crate) fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// State of the transport, as pushed in by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No transport attached.
    Disconnected,
    /// The transport is being set up.
    Connecting,
    /// The stream is open and elements can be exchanged.
    Connected,
    /// The stream is being closed.
    Disconnecting,
}

/// Outcome of the session bootstrap, for an external reconnect supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionControllerEvent {
    /// The session is bound (or resumed) and usable.
    Successful,

    /// The session failed in a way a reconnect cannot fix.
    ErrorStop(String),

    /// The session failed, but a new connection may succeed.
    ErrorReconnect {
        /// Human-readable cause.
        message: String,
        /// Reconnect without back-off.
        immediately: bool,
        /// Reconnect even if the supervisor would otherwise give up.
        force: bool,
    },
}

/// Outcome of the XEP-0198 negotiation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamManagementEvent {
    /// The server enabled stream management.
    Enabled {
        /// Resumption id, if any.
        id: Option<String>,
        /// Whether the server allows resumption.
        resume: bool,
        /// Resumption window preferred by the server, in seconds.
        max: Option<u32>,
    },

    /// Enabling or resuming failed. All unacknowledged stanzas are lost.
    Failed(Option<DefinedCondition>),

    /// The previous stream was resumed.
    Resumed {
        /// Number of our stanzas the server had handled.
        h: u32,
        /// Id of the resumed stream.
        prev_id: String,
    },
}

/// Progress of authentication.
#[derive(Debug)]
pub enum AuthEvent {
    /// An exchange using the given mechanism was started.
    Started {
        /// SASL mechanism name.
        mechanism: String,
    },

    /// The server accepted our credentials.
    Success {
        /// Whether the stream has to be restarted before anything else can
        /// happen (legacy SASL).
        restart_required: bool,
        /// Whether a resource was bound as part of authentication.
        inline_bound: bool,
    },

    /// Authentication failed.
    Failed(AuthError),
}

/// Outcome of resource binding.
#[derive(Debug, Clone)]
pub enum BindEvent {
    /// A resource was bound.
    Success {
        /// The full JID assigned by the server.
        jid: Jid,
        /// Whether the bind happened inline during SASL2.
        inline: bool,
    },

    /// The server refused to bind a resource.
    Failed(RequestError),
}

/// Progress of in-band registration.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    /// The server sent its registration form.
    FormReceived(RegistrationForm),

    /// The account was created.
    Completed,

    /// Registration failed.
    Failed(RequestError),
}

/// High-level event published by the client.
#[derive(Debug)]
pub enum Event {
    /// The transport changed state.
    ConnectorStateChanged {
        /// Previous state
        old: ConnectorState,
        /// Current state
        new: ConnectorState,
    },

    /// `<stream:features/>` were received and stored in the session.
    StreamFeaturesReceived,

    /// The server closed the stream with an error.
    StreamError {
        /// Name of the condition element.
        condition: String,
        /// Optional description.
        text: Option<String>,
        /// Target of a `<see-other-host/>` redirect.
        see_other_host: Option<String>,
    },

    /// The transport could not parse the incoming XML.
    ParseError(String),

    /// Authentication progress.
    Authentication(AuthEvent),

    /// Resource binding outcome.
    Bind(BindEvent),

    /// Stream management outcome.
    StreamManagement(StreamManagementEvent),

    /// In-band registration progress.
    Registration(RegistrationEvent),

    /// Session bootstrap outcome.
    Session(SessionControllerEvent),

    /// Service discovery result for an entity.
    Discovery {
        /// Entity which was queried
        jid: Jid,
        /// Features it advertises
        features: Vec<String>,
    },

    /// The roster query result.
    Roster(Element),

    /// A message stanza arrived.
    Message(Element),

    /// A presence stanza arrived.
    Presence(Element),
}

/// Handle for publishing events, usable from response handlers.
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Publish an event.
    pub fn fire(&self, event: Event) {
        // The receiving side lives as long as the client.
        let _: Result<_, _> = self.inner.send(event);
    }
}

/// Queue of published events which have not been dispatched yet.
pub(crate) struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            inner: self.tx.clone(),
        }
    }

    pub fn fire(&self, event: Event) {
        let _: Result<_, _> = self.tx.send(event);
    }

    /// Take the oldest pending event.
    pub fn next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
