// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::collections::BTreeMap;

use tokio::time::Instant;

use jid::Jid;
use minidom::Element;

use super::request::{Request, RequestKey};

/// Registry of requests waiting for a reply.
///
/// Requests are keyed by element name and stanza id. A request is removed
/// from the registry as soon as it is matched, timed out or cancelled, so no
/// reply is ever dispatched twice.
#[derive(Debug, Default)]
pub struct RequestsManager {
    requests: BTreeMap<RequestKey, Request>,
    bound_jid: Option<Jid>,
}

impl RequestsManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the JID bound to the session, used to match replies to requests
    /// without an explicit recipient.
    pub fn set_bound_jid(&mut self, jid: Option<Jid>) {
        self.bound_jid = jid;
    }

    /// Number of requests waiting for a reply.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no request is waiting for a reply.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Whether a request with this key is registered.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.requests.contains_key(key)
    }

    /// Track `request` until its reply arrives.
    pub fn register(&mut self, request: Request) {
        let key = request.key().clone();
        log::trace!("Registering request {}.", key);
        if let Some(previous) = self.requests.insert(key, request) {
            log::warn!(
                "Request {} replaced an older request with the same id.",
                previous.key()
            );
        }
    }

    /// Remove and return the request `reply` answers, if any.
    pub fn get_request(&mut self, reply: &Element) -> Option<Request> {
        if reply.name() == "iq" && !matches!(reply.attr("type"), Some("result") | Some("error")) {
            return None;
        }
        let key = RequestKey::of(reply)?;
        let request = self.requests.get(&key)?;
        if !self.verify(request, reply) {
            log::debug!(
                "Ignoring reply {} from {:?}: sender does not match the request.",
                key,
                reply.attr("from")
            );
            return None;
        }
        self.requests.remove(&key)
    }

    fn verify(&self, request: &Request, reply: &Element) -> bool {
        let from = match reply.attr("from").map(Jid::new) {
            None => None,
            Some(Ok(jid)) => Some(jid),
            Some(Err(e)) => {
                log::debug!("Reply with unparseable sender: {}", e);
                return false;
            }
        };
        let bound_bare = self.bound_jid.as_ref().map(Jid::to_bare);
        match (request.to(), from) {
            (None, None) => true,
            (Some(to), Some(from)) => {
                from == *to || (to.is_bare() && from.to_bare() == to.to_bare())
            }
            // Replies from our own account may omit their sender.
            (Some(to), None) => bound_bare.is_some_and(|bare| to.to_bare() == bare),
            (None, Some(from)) => bound_bare.is_some_and(|bare| from.to_bare() == bare),
        }
    }

    /// Resolve the request `reply` answers.
    ///
    /// Returns whether a request was found.
    pub fn find_and_execute(&mut self, reply: &Element) -> bool {
        match self.get_request(reply) {
            Some(mut request) => {
                log::trace!("Dispatching reply to request {}.", request.key());
                request.set_response_stanza(reply);
                true
            }
            None => false,
        }
    }

    /// Time out every request created at or before `cutoff`, or all of them
    /// if `cutoff` is `None`.
    pub fn timeout_all(&mut self, cutoff: Option<Instant>) -> usize {
        let expired: Vec<RequestKey> = self
            .requests
            .iter()
            .filter(|(_, request)| cutoff.map_or(true, |cutoff| request.created() <= cutoff))
            .map(|(key, _)| key.clone())
            .collect();
        let count = self.expire(expired);
        if count > 0 {
            log::debug!("Timed out {} pending requests.", count);
        }
        count
    }

    /// Time out every request whose reply is overdue at `now`, and forget
    /// requests which were completed by other means.
    pub fn find_outdated(&mut self, now: Instant) -> usize {
        self.requests.retain(|_, request| !request.is_completed());
        let outdated: Vec<RequestKey> = self
            .requests
            .iter()
            .filter(|(_, request)| request.is_outdated(now))
            .map(|(key, _)| key.clone())
            .collect();
        self.expire(outdated)
    }

    fn expire(&mut self, keys: Vec<RequestKey>) -> usize {
        let mut count = 0;
        for key in keys {
            if let Some(mut request) = self.requests.remove(&key) {
                if request.mark_timeout() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Cancel the request with the given key.
    ///
    /// Returns whether such a request was waiting for a reply.
    pub fn cancel(&mut self, key: &RequestKey) -> bool {
        match self.requests.remove(key) {
            Some(mut request) => request.cancel(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::{Arc, Mutex};

    use crate::requests::{RequestBuilderFactory, RequestError};

    type Seen = Arc<Mutex<Vec<Result<Element, RequestError>>>>;

    fn request(stanza: &str) -> (Request, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let request = RequestBuilderFactory::default()
            .iq(stanza.parse().unwrap())
            .response(move |r| sink.lock().unwrap().push(r))
            .build();
        (request, seen)
    }

    fn parse(s: &str) -> Element {
        s.parse().unwrap()
    }

    #[test]
    fn matches_explicit_recipient_any_resource() {
        let mut manager = RequestsManager::new();
        let (req, seen) = request("<iq xmlns='jabber:client' type='get' id='r1' to='a@b'/>");
        manager.register(req);

        assert!(!manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='r1' from='c@d'/>"
        )));
        assert!(manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='r1' from='a@b/res'/>"
        )));
        assert!(manager.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);

        // The entry is gone, a duplicate reply does not match.
        assert!(!manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='r1' from='a@b/res'/>"
        )));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn full_recipient_requires_exact_sender() {
        let mut manager = RequestsManager::new();
        let (req, _) = request("<iq xmlns='jabber:client' type='get' id='r1' to='a@b/one'/>");
        manager.register(req);
        assert!(!manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='r1' from='a@b/two'/>"
        )));
        assert!(manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='r1' from='a@b/one'/>"
        )));
    }

    #[test]
    fn no_recipient_matches_bound_bare_jid() {
        let mut manager = RequestsManager::new();
        manager.set_bound_jid(Some(Jid::new("me@example.org/laptop").unwrap()));

        let (req, _) = request("<iq xmlns='jabber:client' type='get' id='roster'/>");
        manager.register(req);
        assert!(!manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='roster' from='mallory@example.org'/>"
        )));
        assert!(manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='roster' from='me@example.org'/>"
        )));

        let (req, _) = request("<iq xmlns='jabber:client' type='get' id='bind'/>");
        manager.register(req);
        assert!(manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='result' id='bind'/>"
        )));
    }

    #[test]
    fn requests_and_key_mismatches_do_not_match() {
        let mut manager = RequestsManager::new();
        let (req, _) = request("<iq xmlns='jabber:client' type='get' id='r1'/>");
        manager.register(req);
        assert!(!manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='get' id='r1'/>"
        )));
        assert!(!manager.find_and_execute(&parse(
            "<message xmlns='jabber:client' id='r1'/>"
        )));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn error_reply_resolves_failure() {
        let mut manager = RequestsManager::new();
        let (req, seen) = request("<iq xmlns='jabber:client' type='get' id='r1' to='a@b'/>");
        manager.register(req);
        assert!(manager.find_and_execute(&parse(
            "<iq xmlns='jabber:client' type='error' id='r1' from='a@b'><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
        )));
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0].as_ref().unwrap_err().condition(),
            Some(&xmpp_parsers::stanza_error::DefinedCondition::ServiceUnavailable)
        );
    }

    #[test]
    fn timeout_all_respects_cutoff() {
        let mut manager = RequestsManager::new();
        let (old, old_seen) = request("<iq xmlns='jabber:client' type='get' id='old'/>");
        let cutoff = old.created();
        manager.register(old);
        let (new, new_seen) = request("<iq xmlns='jabber:client' type='get' id='new'/>");
        let new_created = new.created();
        manager.register(new);

        let expired = manager.timeout_all(Some(cutoff));
        if new_created > cutoff {
            assert_eq!(expired, 1);
            assert!(new_seen.lock().unwrap().is_empty());
        } else {
            assert_eq!(expired, 2);
        }
        assert!(old_seen.lock().unwrap()[0].as_ref().unwrap_err().is_timeout());

        manager.timeout_all(None);
        assert!(manager.is_empty());
        assert_eq!(new_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn find_outdated_times_out_overdue_requests() {
        let mut manager = RequestsManager::new();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let short = RequestBuilderFactory::default()
            .iq(parse("<iq xmlns='jabber:client' type='get' id='short'/>"))
            .timeout(Duration::from_secs(1))
            .response(move |r| sink.lock().unwrap().push(r))
            .build();
        let created = short.created();
        manager.register(short);
        let (long, long_seen) = request("<iq xmlns='jabber:client' type='get' id='long'/>");
        manager.register(long);

        assert_eq!(manager.find_outdated(created), 0);
        assert_eq!(manager.find_outdated(created + Duration::from_secs(2)), 1);
        assert!(seen.lock().unwrap()[0].as_ref().unwrap_err().is_timeout());
        assert!(long_seen.lock().unwrap().is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn completed_requests_are_swept_silently() {
        let mut manager = RequestsManager::new();
        let (mut req, seen) = request("<iq xmlns='jabber:client' type='get' id='r1'/>");
        req.cancel();
        manager.register(req);
        assert_eq!(manager.find_outdated(Instant::now()), 0);
        assert!(manager.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_by_key() {
        let mut manager = RequestsManager::new();
        let (req, seen) = request("<iq xmlns='jabber:client' type='get' id='r1'/>");
        let key = req.key().clone();
        manager.register(req);
        assert!(manager.cancel(&key));
        assert!(!manager.cancel(&key));
        assert!(matches!(
            seen.lock().unwrap()[0],
            Err(RequestError::Cancelled)
        ));
    }
}
