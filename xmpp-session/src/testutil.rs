// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helpers for driving modules without a client.

use std::io;
use std::sync::{Arc, Mutex};

use jid::Jid;
use minidom::Element;
use tokio::time::Instant;

use crate::client::PacketWriter;
use crate::config::Config;
use crate::context::{Context, Outbox, Outgoing};
use crate::event::{Event, EventBus};
use crate::requests::RequestsManager;
use crate::sm::{self, StanzaState};
use crate::store::SessionObject;

pub(crate) fn parse(s: &str) -> Element {
    s.parse().unwrap()
}

/// The pieces of a client, with a fake transport which accepts everything.
pub(crate) struct Harness {
    pub session: SessionObject,
    pub requests: RequestsManager,
    pub outbox: Outbox,
    pub events: EventBus,
    pub config: Config,
    restarts: usize,
    recorded: Vec<Element>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::new(
            Jid::new("juliet@capulet.lit/balcony").unwrap(),
            "secret",
        ))
    }

    pub fn with_config(config: Config) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            session: SessionObject::new(),
            requests: RequestsManager::new(),
            outbox: Outbox::default(),
            events: EventBus::new(),
            config,
            restarts: 0,
            recorded: Vec::new(),
        }
    }

    pub fn context(&mut self) -> Context<'_> {
        Context {
            session: &mut self.session,
            requests: &mut self.requests,
            outbox: &mut self.outbox,
            events: &self.events,
            config: &self.config,
            now: Instant::now(),
        }
    }

    /// Pretend the transport accepted everything in the outbox.
    pub fn flush(&mut self) {
        while let Some(item) = self.outbox.pop() {
            match item {
                Outgoing::Element { entry, request } => {
                    entry.set_state(StanzaState::Sent);
                    if let Some(mut request) = request {
                        if request.is_fire_and_forget() {
                            request.mark_as_sent();
                        } else {
                            self.requests.register(request);
                        }
                    }
                    self.recorded.push(entry.stanza.clone());
                    sm::observe_outgoing(&mut self.session, entry);
                }
                Outgoing::RestartStream => self.restarts += 1,
                Outgoing::Close => {}
            }
        }
    }

    /// Elements sent since the last call.
    pub fn sent(&mut self) -> Vec<Element> {
        self.flush();
        core::mem::take(&mut self.recorded)
    }

    pub fn stream_restarts(&mut self) -> usize {
        self.flush();
        self.restarts
    }

    /// Events published since the last call.
    pub fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.events.next() {
            events.push(event);
        }
        events
    }
}

/// Transport which records what it is asked to do.
#[derive(Clone, Default)]
pub(crate) struct RecordingWriter {
    pub sent: Arc<Mutex<Vec<Element>>>,
    pub restarts: Arc<Mutex<usize>>,
    pub closed: Arc<Mutex<bool>>,
    pub fail: Arc<Mutex<bool>>,
}

impl RecordingWriter {
    pub fn take(&self) -> Vec<Element> {
        core::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl PacketWriter for RecordingWriter {
    fn send(&mut self, element: &Element) -> io::Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.sent.lock().unwrap().push(element.clone());
        Ok(())
    }

    fn restart_stream(&mut self) -> io::Result<()> {
        *self.restarts.lock().unwrap() += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}
