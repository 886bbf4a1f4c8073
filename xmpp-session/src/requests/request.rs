// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use core::time::Duration;

use tokio::time::Instant;

use jid::Jid;
use minidom::Element;
use xmpp_parsers::stanza_error::{DefinedCondition, StanzaError};

use super::RequestError;
use crate::ns;

/// Identity of a request: element name and stanza id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    /// Element name (`iq`, `message` or `presence`)
    pub name: String,
    /// Stanza id
    pub id: String,
}

impl RequestKey {
    /// Key of the request an incoming element would answer.
    ///
    /// Returns `None` for elements without an id.
    pub fn of(elem: &Element) -> Option<Self> {
        Some(Self {
            name: elem.name().to_owned(),
            id: elem.attr("id")?.to_owned(),
        })
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

pub(super) type Resolver = Box<dyn FnOnce(Result<Element, RequestError>) + Send>;

/// One outstanding round trip.
///
/// A request is resolved exactly once: by a reply, a timeout, a local
/// cancellation or (for messages and presences) by being handed to the
/// transport. Later attempts are ignored.
pub struct Request {
    key: RequestKey,
    to: Option<Jid>,
    label: Option<String>,
    created: Instant,
    timeout: Duration,
    stanza: Element,
    resolver: Option<Resolver>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("key", &self.key)
            .field("to", &self.to)
            .field("label", &self.label)
            .field("created", &self.created)
            .field("timeout", &self.timeout)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Request {
    pub(super) fn new(
        stanza: Element,
        key: RequestKey,
        to: Option<Jid>,
        label: Option<String>,
        timeout: Duration,
        resolver: Resolver,
    ) -> Self {
        Self {
            key,
            to,
            label,
            created: Instant::now(),
            timeout,
            stanza,
            resolver: Some(resolver),
        }
    }

    /// (element name, id) of the stanza.
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Intended recipient, if the stanza carries one.
    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    /// Label set with [`RequestBuilder::name`][`super::RequestBuilder::name`].
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The stanza to send.
    pub fn stanza(&self) -> &Element {
        &self.stanza
    }

    /// When the request was built.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// How long to wait for a reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the request has been resolved.
    pub fn is_completed(&self) -> bool {
        self.resolver.is_none()
    }

    /// Whether this kind of stanza never gets a reply and is resolved when
    /// it is handed to the transport.
    pub fn is_fire_and_forget(&self) -> bool {
        self.key.name != "iq"
    }

    /// Whether the reply should have arrived by `now`.
    pub fn is_outdated(&self, now: Instant) -> bool {
        self.created + self.timeout <= now
    }

    fn complete(&mut self, result: Result<Element, RequestError>) -> bool {
        match self.resolver.take() {
            Some(resolver) => {
                resolver(result);
                true
            }
            None => {
                log::warn!("Request {} was already completed.", self.key);
                false
            }
        }
    }

    /// Fail the request with a `remote-server-timeout` condition.
    pub fn mark_timeout(&mut self) -> bool {
        log::debug!(
            "Request {} ({}) timed out.",
            self.key,
            self.label.as_deref().unwrap_or("unnamed")
        );
        self.complete(Err(RequestError::timeout()))
    }

    /// Resolve a message or presence once it was handed to the transport.
    ///
    /// IQs need a reply and are left untouched.
    pub fn mark_as_sent(&mut self) -> bool {
        if !self.is_fire_and_forget() {
            return false;
        }
        let stanza = self.stanza.clone();
        self.complete(Ok(stanza))
    }

    /// Resolve the request with the reply of the peer.
    pub fn set_response_stanza(&mut self, reply: &Element) -> bool {
        let result = if reply.attr("type") == Some("error") {
            Err(parse_error_reply(reply))
        } else {
            Ok(reply.clone())
        };
        self.complete(result)
    }

    /// Cancel the request locally.
    pub fn cancel(&mut self) -> bool {
        self.complete(Err(RequestError::Cancelled))
    }

    pub(crate) fn fail(&mut self, error: RequestError) -> bool {
        self.complete(Err(error))
    }
}

/// Extract condition and description from a `type="error"` stanza.
fn parse_error_reply(reply: &Element) -> RequestError {
    let Some(error) = reply
        .children()
        .find(|child| child.name() == "error")
    else {
        return RequestError::Stanza {
            condition: DefinedCondition::UndefinedCondition,
            text: None,
        };
    };

    if let Ok(parsed) = StanzaError::try_from(error.clone()) {
        return RequestError::Stanza {
            condition: parsed.defined_condition,
            text: parsed.texts.into_values().next(),
        };
    }

    // Lenient fallback for errors which do not validate.
    let condition = error
        .children()
        .filter(|child| child.has_ns(ns::XMPP_STANZAS) && child.name() != "text")
        .find_map(|child| DefinedCondition::try_from(child.clone()).ok())
        .unwrap_or(DefinedCondition::UndefinedCondition);
    let text = error
        .get_child("text", ns::XMPP_STANZAS)
        .map(|text| text.text());
    RequestError::Stanza { condition, text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_request(stanza: &str) -> (Request, Arc<Mutex<Vec<Result<Element, RequestError>>>>) {
        let stanza: Element = stanza.parse().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let key = RequestKey::of(&stanza).unwrap();
        let request = Request::new(
            stanza,
            key,
            None,
            None,
            Duration::from_secs(30),
            Box::new(move |result| sink.lock().unwrap().push(result)),
        );
        (request, seen)
    }

    #[test]
    fn completes_exactly_once() {
        let (mut request, seen) =
            recording_request("<iq xmlns='jabber:client' type='get' id='r1'/>");
        let reply: Element = "<iq xmlns='jabber:client' type='result' id='r1'/>"
            .parse()
            .unwrap();
        assert!(request.set_response_stanza(&reply));
        assert!(request.is_completed());
        assert!(!request.mark_timeout());
        assert!(!request.cancel());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].is_ok());
    }

    #[test]
    fn error_reply_carries_condition_and_text() {
        let (mut request, seen) =
            recording_request("<iq xmlns='jabber:client' type='get' id='r2'/>");
        let reply: Element = "<iq xmlns='jabber:client' type='error' id='r2'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>No such node</text></error></iq>"
            .parse()
            .unwrap();
        request.set_response_stanza(&reply);
        let seen = seen.lock().unwrap();
        match &seen[0] {
            Err(RequestError::Stanza { condition, text }) => {
                assert_eq!(*condition, DefinedCondition::ItemNotFound);
                assert_eq!(text.as_deref(), Some("No such node"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn timeout_condition() {
        let (mut request, seen) =
            recording_request("<iq xmlns='jabber:client' type='get' id='r3'/>");
        assert!(request.mark_timeout());
        let seen = seen.lock().unwrap();
        assert!(seen[0].as_ref().unwrap_err().is_timeout());
    }

    #[test]
    fn mark_as_sent_only_for_fire_and_forget() {
        let (mut iq, iq_seen) = recording_request("<iq xmlns='jabber:client' type='get' id='r4'/>");
        assert!(!iq.mark_as_sent());
        assert!(!iq.is_completed());
        assert!(iq_seen.lock().unwrap().is_empty());

        let (mut message, message_seen) =
            recording_request("<message xmlns='jabber:client' id='m1'><body>hi</body></message>");
        assert!(message.mark_as_sent());
        assert!(message.is_completed());
        assert!(message_seen.lock().unwrap()[0].is_ok());
    }

    #[test]
    fn outdated() {
        let (request, _) = recording_request("<iq xmlns='jabber:client' type='get' id='r5'/>");
        assert!(!request.is_outdated(request.created()));
        assert!(request.is_outdated(request.created() + Duration::from_secs(30)));
    }
}
