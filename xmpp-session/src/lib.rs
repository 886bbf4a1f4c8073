// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Transport-independent [XMPP](https://xmpp.org/) client session engine.
//!
//! This crate implements the parts of a client which sit between a parsed
//! XML stream and the application:
//!
//! - correlation of outgoing requests with their replies, including
//!   timeouts and result transformations ([`requests`]);
//! - [XEP-0198](https://xmpp.org/extensions/xep-0198.html) stream
//!   management with acks and session resumption ([`sm`]);
//! - the session bootstrap: SASL or SASL2 authentication, in-band
//!   registration, resource binding and resumption, driven by events;
//! - a module registry which installs protocol modules in dependency order
//!   ([`modules`]).
//!
//! # Getting started
//!
//! Create a [`Client`] from a [`Config`] and hand it to a [`SessionWorker`].
//! Whoever owns the connection attaches a [`PacketWriter`] once the stream
//! is open, feeds every received element to the worker and reports the
//! loss of the connection. Outcomes of the session bootstrap are published
//! as [`Event::Session`]; reconnecting is left to the caller.
//!
//! The [`Client`] can also be driven directly, which is what the worker
//! does: it never blocks and does no I/O of its own.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

mod client;
/// Client configuration
pub mod config;
mod context;
mod controller;
/// Detailed error types
pub mod error;
mod event;
pub mod modules;
pub mod ns;
pub mod requests;
pub mod sm;
pub mod store;
mod worker;

#[cfg(test)]
mod testutil;

pub use client::{default_modules, Client, PacketWriter};
pub use config::{Config, RegistrationConfig};
pub use context::Context;
#[doc(inline)]
pub use error::Error;
pub use event::{
    AuthEvent, BindEvent, ConnectorState, Event, EventSender, RegistrationEvent,
    SessionControllerEvent, StreamManagementEvent,
};
pub use worker::SessionWorker;

// Re-exports
pub use jid;
pub use minidom;
pub use xmpp_parsers as parsers;
