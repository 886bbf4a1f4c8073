// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::io;

use tokio::time::Instant;

use jid::Jid;
use minidom::Element;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::config::Config;
use crate::context::{Context, Outbox, Outgoing};
use crate::controller::SessionController;
use crate::error::{ConfigurationError, Error};
use crate::event::{ConnectorState, Event, EventBus, SessionControllerEvent};
use crate::modules::bind::BindModule;
use crate::modules::disco::DiscoveryModule;
use crate::modules::message::MessageModule;
use crate::modules::presence::PresenceModule;
use crate::modules::register::InBandRegistrationModule;
use crate::modules::roster::RosterModule;
use crate::modules::sasl::SaslModule;
use crate::modules::sasl2::Sasl2Module;
use crate::modules::stream::{stream_error, StreamErrorModule, StreamFeaturesModule};
use crate::modules::{reply_to, ModuleDescriptor, ModuleProvider, ModulesManager};
use crate::requests::{Request, RequestBuilderFactory, RequestError, RequestKey, RequestWriter};
use crate::sm::{self, OpaqueIoError, QueueEntry, StanzaState, StanzaToken, StreamManagementModule};
use crate::store::{Scope, SessionObject};

/// The sending half of a transport.
///
/// The client hands every outgoing element to the writer in order. Reading
/// is up to the owner of the transport, who feeds parsed elements to
/// [`Client::process_received`].
pub trait PacketWriter: Send {
    /// Serialize and send `element`.
    fn send(&mut self, element: &Element) -> io::Result<()>;

    /// Reset the XML stream after successful legacy SASL authentication.
    fn restart_stream(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Send the stream footer and shut the transport down.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The state modules operate on.
struct Core {
    config: Config,
    session: SessionObject,
    requests: crate::requests::RequestsManager,
    outbox: Outbox,
    events: EventBus,
}

impl Core {
    fn context(&mut self, now: Instant) -> Context<'_> {
        Context {
            session: &mut self.session,
            requests: &mut self.requests,
            outbox: &mut self.outbox,
            events: &self.events,
            config: &self.config,
            now,
        }
    }
}

/// Modules installed by [`Client::new`].
pub fn default_modules() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new::<StreamFeaturesModule>(),
        ModuleDescriptor::new::<StreamErrorModule>(),
        ModuleDescriptor::new::<Sasl2Module>(),
        ModuleDescriptor::new::<SaslModule>(),
        ModuleDescriptor::new::<BindModule>(),
        ModuleDescriptor::new::<InBandRegistrationModule>(),
        ModuleDescriptor::new::<StreamManagementModule>(),
        ModuleDescriptor::new::<PresenceModule>(),
        ModuleDescriptor::new::<MessageModule>(),
        ModuleDescriptor::new::<RosterModule>(),
        ModuleDescriptor::new::<DiscoveryModule>(),
    ]
}

fn expects_reply(stanza: &Element) -> bool {
    sm::is_stanza(stanza) && !matches!(stanza.attr("type"), Some("error") | Some("result"))
}

fn error_reply(stanza: &Element, error: StanzaError) -> Element {
    reply_to(stanza, "error").append(Element::from(error)).build()
}

/// XMPP client session.
///
/// The client owns the request registry, the stream management state and
/// the installed modules, and mutates them only through `&mut self`. It does
/// no I/O on its own: the owner of the transport attaches a
/// [`PacketWriter`], feeds it received elements and calls
/// [`tick`][`Self::tick`] periodically. See
/// [`SessionWorker`][`crate::SessionWorker`] for a ready-made tokio driver.
pub struct Client {
    core: Core,
    modules: ModulesManager,
    controller: SessionController,
    writer: Option<Box<dyn PacketWriter>>,
    connector_state: ConnectorState,
    published: VecDeque<Event>,
}

impl Client {
    /// Create a client with the default modules.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_modules(config, Vec::new())
    }

    /// Create a client with the default modules and `extra`.
    ///
    /// Fails with [`ConfigurationError::DependencyCycle`] if the modules
    /// cannot be ordered, and with [`ConfigurationError::MissingCredentials`]
    /// if a password is given for a JID without a local part.
    pub fn with_modules(config: Config, extra: Vec<ModuleDescriptor>) -> Result<Self, Error> {
        if config.password.is_some() && config.jid.node().is_none() {
            return Err(ConfigurationError::MissingCredentials.into());
        }
        let mut requests = crate::requests::RequestsManager::new();
        // Replies from our own account may omit their sender even before
        // a resource is bound.
        requests.set_bound_jid(Some(config.jid.clone()));
        let mut client = Client {
            core: Core {
                config,
                session: SessionObject::new(),
                requests,
                outbox: Outbox::default(),
                events: EventBus::new(),
            },
            modules: ModulesManager::new(),
            controller: SessionController::new(),
            writer: None,
            connector_state: ConnectorState::Disconnected,
            published: VecDeque::new(),
        };
        let mut descriptors = default_modules();
        descriptors.extend(extra);
        client.install(descriptors)?;
        Ok(client)
    }

    /// Install another batch of modules.
    pub fn install(&mut self, descriptors: Vec<ModuleDescriptor>) -> Result<(), Error> {
        let now = Instant::now();
        let mut ctx = self.core.context(now);
        let result = self.modules.install(descriptors, &mut ctx);
        self.run(now);
        result
    }

    /// Client configuration.
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Session properties.
    pub fn session(&self) -> &SessionObject {
        &self.core.session
    }

    /// The full JID bound to this session, once binding succeeded.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.core.session.bound_jid()
    }

    /// State of the transport.
    pub fn connector_state(&self) -> ConnectorState {
        self.connector_state
    }

    /// The installed modules.
    pub fn modules(&self) -> &ModulesManager {
        &self.modules
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.core.requests.len()
    }

    /// Factory for requests with the configured default timeout. Send the
    /// built request with `.send(&mut client)`.
    pub fn request(&self) -> RequestBuilderFactory {
        RequestBuilderFactory::new(self.core.config.request_timeout)
    }

    /// Send an element without tracking a reply.
    pub fn write_directly(&mut self, element: Element) -> StanzaToken {
        let now = Instant::now();
        let token = self.core.context(now).write_directly(element);
        self.run(now);
        token
    }

    /// Queue an element built elsewhere, e.g. by a
    /// [`SessionWorker`][`crate::SessionWorker`] handle.
    pub(crate) fn write_entry(&mut self, entry: QueueEntry, request: Option<Request>) {
        let now = Instant::now();
        self.core.outbox.push(Outgoing::Element { entry, request });
        self.run(now);
    }

    /// Run `f` on the installed module `M`.
    pub fn with_module<M, R, F>(&mut self, f: F) -> Result<R, Error>
    where
        M: ModuleProvider,
        F: FnOnce(&mut M, &mut Context) -> R,
    {
        let now = Instant::now();
        let module = self.modules.require_mut::<M>()?;
        let mut ctx = self.core.context(now);
        let result = f(module, &mut ctx);
        self.run(now);
        Ok(result)
    }

    /// The transport is being set up.
    pub fn connecting(&mut self) {
        self.set_connector_state(ConnectorState::Connecting);
        self.run(Instant::now());
    }

    /// The transport is up and the stream header was exchanged. Stream
    /// features are expected next.
    pub fn connection_established(&mut self, writer: Box<dyn PacketWriter>) {
        log::debug!("connection established");
        self.writer = Some(writer);
        self.set_connector_state(ConnectorState::Connected);
        self.run(Instant::now());
    }

    /// The transport went away.
    ///
    /// If the session can be resumed, pending requests and unacknowledged
    /// stanzas are kept for the next connection.
    pub fn connection_lost(&mut self) {
        log::debug!("connection lost");
        self.writer = None;
        self.set_connector_state(ConnectorState::Disconnected);
        self.run(Instant::now());
    }

    /// Close the stream once everything written so far was sent.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if self.writer.is_none() {
            return Err(Error::NotConnected);
        }
        let now = Instant::now();
        self.core.context(now).close();
        self.run(now);
        Ok(())
    }

    /// The transport could not parse what the server sent.
    pub fn parse_error(&mut self, message: &str) {
        self.core.events.fire(Event::ParseError(message.to_owned()));
        self.run(Instant::now());
    }

    /// Handle an element received from the server.
    ///
    /// Replies to our requests are dispatched to their handlers. Everything
    /// else goes to the modules whose criteria match.
    pub fn process_received(&mut self, element: Element) {
        let now = Instant::now();
        log::trace!("received <{}/> ({:?})", element.name(), element.ns());
        sm::observe_incoming(&mut self.core.session, &element);
        if !self.core.requests.find_and_execute(&element) {
            self.route(now, &element);
        }
        self.run(now);
    }

    fn route(&mut self, now: Instant, element: &Element) {
        let targets = self.modules.modules_for(element);
        let mut ctx = self.core.context(now);

        if targets.is_empty() {
            if expects_reply(element) {
                log::debug!("no module handles <{}/>", element.name());
                let error = StanzaError::new(
                    ErrorType::Cancel,
                    DefinedCondition::FeatureNotImplemented,
                    "en",
                    "Feature not implemented.",
                );
                ctx.write_directly(error_reply(element, error));
            } else if sm::is_stanza(element) {
                log::debug!(
                    "dropping unexpected <{} type={:?}/>",
                    element.name(),
                    element.attr("type")
                );
            } else {
                log::warn!(
                    "unsupported element <{}/> in {:?}",
                    element.name(),
                    element.ns()
                );
                ctx.write_directly(stream_error("unsupported-stanza-type"));
                ctx.close();
            }
            return;
        }

        let mut replied = false;
        for index in targets {
            let error = match self.modules.process(index, &mut ctx, element) {
                Ok(()) => continue,
                Err(Error::Stanza(error)) => error,
                Err(e) => {
                    log::warn!("processing <{}/> failed: {}", element.name(), e);
                    StanzaError::new(
                        ErrorType::Wait,
                        DefinedCondition::InternalServerError,
                        "en",
                        "Internal error.",
                    )
                }
            };
            if !replied && expects_reply(element) {
                ctx.write_directly(error_reply(element, error));
                replied = true;
            }
        }
    }

    /// Periodic housekeeping: time out overdue requests and exchange
    /// stream management acks.
    pub fn tick(&mut self, now: Instant) {
        let expired = self.core.requests.find_outdated(now);
        if expired > 0 {
            log::debug!("{} requests timed out", expired);
        }
        if self.writer.is_some() {
            if let Some(sm) = self.modules.get_mut::<StreamManagementModule>() {
                sm.on_tick(&mut self.core.context(now));
            }
        }
        self.run(now);
    }

    /// Cancel a pending request. Its handlers see
    /// [`RequestError::Cancelled`].
    pub fn cancel(&mut self, key: &RequestKey) -> bool {
        let cancelled = self.core.requests.cancel(key);
        self.run(Instant::now());
        cancelled
    }

    /// Take the events published so far.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.published.drain(..).collect()
    }

    /// Take the oldest published event.
    pub fn next_event(&mut self) -> Option<Event> {
        self.published.pop_front()
    }

    fn set_connector_state(&mut self, new: ConnectorState) {
        let old = self.connector_state;
        if old == new {
            return;
        }
        log::debug!("connector state {:?} -> {:?}", old, new);
        self.connector_state = new;
        self.core
            .events
            .fire(Event::ConnectorStateChanged { old, new });
    }

    /// Flush the outbox and let the session controller react to events
    /// until nothing is left to do.
    fn run(&mut self, now: Instant) {
        loop {
            self.flush();
            let Some(event) = self.core.events.next() else {
                break;
            };
            let mut ctx = self.core.context(now);
            if let Err(e) = self.controller.on_event(&mut ctx, &mut self.modules, &event) {
                log::error!("session controller failed: {}", e);
                ctx.fire(Event::Session(SessionControllerEvent::ErrorStop(
                    e.to_string(),
                )));
            }
            self.published.push_back(event);
        }
    }

    fn flush(&mut self) {
        while let Some(item) = self.core.outbox.pop() {
            match item {
                Outgoing::Element { entry, request } => self.send_entry(entry, request),
                Outgoing::RestartStream => {
                    if let Some(writer) = self.writer.as_mut() {
                        if let Err(e) = writer.restart_stream() {
                            log::warn!("restarting the stream failed: {}", e);
                        }
                    }
                    self.core.session.clear(Scope::Stream);
                }
                Outgoing::Close => {
                    if let Some(mut writer) = self.writer.take() {
                        if let Err(e) = writer.close() {
                            log::warn!("closing the stream failed: {}", e);
                        }
                    }
                    self.set_connector_state(ConnectorState::Disconnecting);
                }
            }
        }
    }

    fn send_entry(&mut self, entry: QueueEntry, request: Option<Request>) {
        let Some(writer) = self.writer.as_mut() else {
            log::debug!("not connected, dropping <{}/>", entry.stanza.name());
            entry.set_state(StanzaState::Dropped);
            if let Some(mut request) = request {
                request.fail(RequestError::NotConnected);
            }
            return;
        };
        if let Err(e) = writer.send(&entry.stanza) {
            log::warn!("sending <{}/> failed: {}", entry.stanza.name(), e);
            let error = OpaqueIoError::from(&e);
            entry.set_state(StanzaState::Failed {
                error: error.clone(),
            });
            if let Some(mut request) = request {
                request.fail(RequestError::Send(error));
            }
            return;
        }
        entry.set_state(StanzaState::Sent);
        if let Some(mut request) = request {
            if request.is_fire_and_forget() {
                request.mark_as_sent();
            } else {
                self.core.requests.register(request);
            }
        }
        sm::observe_outgoing(&mut self.core.session, entry);
    }
}

impl RequestWriter for Client {
    fn write(&mut self, request: Request) -> StanzaToken {
        let now = Instant::now();
        let token = self.core.context(now).write(request);
        self.run(now);
        token
    }
}
