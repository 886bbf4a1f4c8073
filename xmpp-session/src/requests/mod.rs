// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Correlation of outgoing stanzas with their replies.
//!
//! A [`Request`] is one outstanding round trip. It is created through a
//! [`RequestBuilder`], which lets the caller stack transformations
//! ([`RequestBuilder::map`]) and handlers ([`RequestBuilder::response`]) on
//! top of the raw reply. The [`RequestsManager`] keeps track of requests
//! which have been sent and matches incoming replies against them.

use alloc::sync::Arc;
use core::error::Error as StdError;
use core::fmt;

use xmpp_parsers::stanza_error::DefinedCondition;

use crate::sm::OpaqueIoError;

mod builder;
mod manager;
mod request;

pub use builder::{
    RequestBuilder, RequestBuilderFactory, RequestHandle, RequestWriter, ResponseToken,
};
pub use manager::RequestsManager;
pub use request::{Request, RequestKey};

/// Default time to wait for a reply.
pub const DEFAULT_TIMEOUT: core::time::Duration = core::time::Duration::from_secs(30);

/// Reason why a request did not produce a value.
#[derive(Debug, Clone)]
pub enum RequestError {
    /// The peer answered with an error, or did not answer in time (in which
    /// case the condition is `remote-server-timeout`).
    Stanza {
        /// Defined error condition
        condition: DefinedCondition,
        /// Human-readable description, if the peer sent one
        text: Option<String>,
    },

    /// A transformation attached with [`RequestBuilder::try_map`] failed.
    Transform(Arc<dyn StdError + Send + Sync>),

    /// The request was cancelled locally.
    Cancelled,

    /// There was no transport to send the request through.
    NotConnected,

    /// The transport failed to send the request.
    Send(OpaqueIoError),

    /// The client went away before the request was resolved.
    LostWorker,
}

impl RequestError {
    /// The failure used when no reply arrives in time.
    pub fn timeout() -> Self {
        RequestError::Stanza {
            condition: DefinedCondition::RemoteServerTimeout,
            text: None,
        }
    }

    /// Whether this is the failure of a request which timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RequestError::Stanza {
                condition: DefinedCondition::RemoteServerTimeout,
                ..
            }
        )
    }

    /// The defined condition, for errors reported by the peer.
    pub fn condition(&self) -> Option<&DefinedCondition> {
        match self {
            RequestError::Stanza { condition, .. } => Some(condition),
            _ => None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stanza {
                condition,
                text: Some(text),
            } => write!(f, "error reply {:?}: {}", condition, text),
            Self::Stanza {
                condition,
                text: None,
            } => write!(f, "error reply {:?}", condition),
            Self::Transform(e) => write!(f, "could not process reply: {}", e),
            Self::Cancelled => f.write_str("request cancelled"),
            Self::NotConnected => f.write_str("not connected"),
            Self::Send(e) => write!(f, "send error: {}", e),
            Self::LostWorker => f.write_str("client went away before the request was resolved"),
        }
    }
}

impl StdError for RequestError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transform(e) => Some(&**e),
            Self::Send(e) => Some(e),
            _ => None,
        }
    }
}
