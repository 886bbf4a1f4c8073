// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tokio driver for a [`Client`].
//!
//! The [`SessionWorker`] moves the client into a task of its own. Transport
//! events, writes and the periodic tick all reach the client through one
//! channel, so the client is only ever touched from that task.

use std::io;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use minidom::Element;

use crate::client::{Client, PacketWriter};
use crate::error::Error;
use crate::event::Event;
use crate::requests::{
    Request, RequestBuilder, RequestError, RequestHandle, RequestWriter, ResponseToken,
};
use crate::sm::{QueueEntry, StanzaState, StanzaToken};

enum Command {
    Connected(Box<dyn PacketWriter>),
    Received(Element),
    ParseError(String),
    Lost,
    Disconnect,
    Write {
        entry: QueueEntry,
        request: Option<Request>,
    },
}

/// Hands requests to the worker task.
struct ChannelWriter<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
}

impl ChannelWriter<'_> {
    fn write_entry(&mut self, element: Element, request: Option<Request>) -> StanzaToken {
        let (entry, token) = QueueEntry::tracked(element);
        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Write { entry, request })
        {
            log::warn!("session worker is gone, dropping write");
            if let Command::Write { entry, request } = command {
                entry.set_state(StanzaState::Dropped);
                if let Some(mut request) = request {
                    request.fail(RequestError::LostWorker);
                }
            }
        }
        token
    }
}

impl RequestWriter for ChannelWriter<'_> {
    fn write(&mut self, request: Request) -> StanzaToken {
        let element = request.stanza().clone();
        self.write_entry(element, Some(request))
    }
}

/// Runs a [`Client`] in a tokio task.
///
/// Events published by the client are forwarded and can be read with
/// [`next_event`][`Self::next_event`].
pub struct SessionWorker {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    task: JoinHandle<Client>,
}

impl SessionWorker {
    /// Move `client` into a new task. Must be called within a tokio
    /// runtime.
    pub fn spawn(client: Client) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(client, command_rx, event_tx));
        Self {
            commands,
            events,
            task,
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("session worker is gone");
        }
    }

    /// See [`Client::connection_established`].
    pub fn connection_established(&self, writer: Box<dyn PacketWriter>) {
        self.command(Command::Connected(writer));
    }

    /// Feed an element received from the server.
    pub fn received(&self, element: Element) {
        self.command(Command::Received(element));
    }

    /// See [`Client::parse_error`].
    pub fn parse_error<S: Into<String>>(&self, message: S) {
        self.command(Command::ParseError(message.into()));
    }

    /// See [`Client::connection_lost`].
    pub fn connection_lost(&self) {
        self.command(Command::Lost);
    }

    /// See [`Client::disconnect`].
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Send an element without tracking a reply.
    pub fn write_directly(&self, element: Element) -> StanzaToken {
        ChannelWriter {
            commands: &self.commands,
        }
        .write_entry(element, None)
    }

    /// Send a request and return a future for its value.
    pub fn send<V: Clone + Send + 'static>(
        &self,
        builder: RequestBuilder<V>,
    ) -> (RequestHandle, ResponseToken<V>) {
        builder.send_and_wait(&mut ChannelWriter {
            commands: &self.commands,
        })
    }

    /// Wait for the next event published by the client.
    ///
    /// Returns `None` once the worker has stopped.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Stop the worker and return the client.
    pub async fn shutdown(self) -> Result<Client, Error> {
        drop(self.commands);
        self.task
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))
    }
}

async fn run(
    mut client: Client,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) -> Client {
    let mut ticker = time::interval(client.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connected(writer)) => client.connection_established(writer),
                Some(Command::Received(element)) => client.process_received(element),
                Some(Command::ParseError(message)) => client.parse_error(&message),
                Some(Command::Lost) => client.connection_lost(),
                Some(Command::Disconnect) => {
                    if let Err(e) = client.disconnect() {
                        log::debug!("disconnect: {}", e);
                    }
                }
                Some(Command::Write { entry, request }) => client.write_entry(entry, request),
                None => {
                    log::debug!("all session handles dropped, stopping worker");
                    break;
                }
            },
            _ = ticker.tick() => client.tick(Instant::now()),
        }

        for event in client.take_events() {
            if events.send(event).is_err() {
                log::trace!("nobody listens to session events");
            }
        }
    }
    client
}
