// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lifecycle-scoped session properties.

use core::any::Any;
use core::fmt;
use std::collections::HashMap;

use jid::Jid;
use minidom::Element;

use crate::ns;

/// Lifetime of a stored property, narrowest first.
///
/// Clearing a scope also clears every narrower scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Valid until the next stream restart (e.g. after SASL).
    Stream,
    /// Valid until the transport goes away.
    Connection,
    /// Valid as long as the session can be resumed.
    Session,
    /// Valid until the user clears it.
    User,
}

/// Authentication progress of the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing happened yet.
    Unknown,
    /// An exchange is in flight.
    InProgress,
    /// The server accepted our credentials.
    Success,
    /// The server rejected our credentials.
    Error,
}

const AUTH_STATE: &str = "auth-state";
const BOUND_JID: &str = "bound-jid";
const STREAM_FEATURES: &str = "stream-features";

struct Entry {
    scope: Scope,
    value: Box<dyn Any + Send>,
}

/// Property store keyed by name, where every property belongs to a
/// [`Scope`].
#[derive(Default)]
pub struct SessionObject {
    entries: HashMap<&'static str, Entry>,
}

impl fmt::Debug for SessionObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .map(|(k, e)| (e.scope, *k))
            .collect();
        keys.sort();
        f.debug_struct("SessionObject")
            .field("keys", &keys)
            .finish()
    }
}

impl SessionObject {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send>(&mut self, scope: Scope, key: &'static str, value: T) {
        self.entries.insert(
            key,
            Entry {
                scope,
                value: Box::new(value),
            },
        );
    }

    /// Read the value stored under `key`, if it has type `T`.
    pub fn get<T: Any + Send>(&self, key: &'static str) -> Option<&T> {
        self.entries.get(key)?.value.downcast_ref()
    }

    /// Mutably borrow the value stored under `key`, if it has type `T`.
    pub fn get_mut<T: Any + Send>(&mut self, key: &'static str) -> Option<&mut T> {
        self.entries.get_mut(key)?.value.downcast_mut()
    }

    /// Remove and return the value stored under `key`.
    pub fn remove<T: Any + Send>(&mut self, key: &'static str) -> Option<T> {
        let entry = self.entries.remove(key)?;
        match entry.value.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(value) => {
                // Wrong type: leave it where it was.
                self.entries.insert(
                    key,
                    Entry {
                        scope: entry.scope,
                        value,
                    },
                );
                None
            }
        }
    }

    /// Whether anything is stored under `key`.
    pub fn contains(&self, key: &'static str) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop every property of `scope` and of all narrower scopes.
    pub fn clear(&mut self, scope: Scope) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.scope > scope);
        log::trace!(
            "cleared {} session properties up to {:?}",
            before - self.entries.len(),
            scope
        );
    }

    /// Authentication state of the current connection.
    pub fn auth_state(&self) -> AuthState {
        self.get(AUTH_STATE).copied().unwrap_or(AuthState::Unknown)
    }

    pub(crate) fn set_auth_state(&mut self, state: AuthState) {
        self.set(Scope::Connection, AUTH_STATE, state);
    }

    /// The full JID bound to this session.
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.get(BOUND_JID)
    }

    pub(crate) fn set_bound_jid(&mut self, jid: Jid) {
        self.set(Scope::Session, BOUND_JID, jid);
    }

    /// The last `<stream:features/>` received on this stream.
    pub fn stream_features(&self) -> Option<&Element> {
        self.get(STREAM_FEATURES)
    }

    pub(crate) fn set_stream_features(&mut self, features: Element) {
        self.set(Scope::Stream, STREAM_FEATURES, features);
    }

    /// Return the stream feature with the given name and namespace.
    pub fn stream_feature(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.stream_features()?.get_child(name, namespace)
    }

    /// Whether the server offers resource binding.
    pub fn can_bind(&self) -> bool {
        self.stream_feature("bind", ns::BIND).is_some()
    }
}
