// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::cmp::Ordering;
use core::fmt;
use std::io;

use tokio::sync::watch;

use minidom::Element;

/// An I/O error which can be cloned and shared between tokens.
#[derive(Debug, Clone)]
pub struct OpaqueIoError {
    kind: io::ErrorKind,
    message: String,
}

impl OpaqueIoError {
    /// Kind of the original error.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Rebuild an [`io::Error`].
    pub fn to_io_error(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

impl From<&io::Error> for OpaqueIoError {
    fn from(other: &io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl fmt::Display for OpaqueIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl core::error::Error for OpaqueIoError {}

/// The stages of stanza delivery.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum StanzaStage {
    /// The stanza waits in the outbox.
    Queued,

    /// The stanza was handed to the transport.
    Sent,

    /// The peer confirmed reception using XEP-0198.
    ///
    /// **Note:** This state is only ever reached on streams where XEP-0198
    /// was succesfully negotiated.
    Acked,

    /// The transport failed to send the stanza.
    Failed,

    /// The stanza was discarded, e.g. because it was never sent or because
    /// stream resumption failed before it was acknowledged.
    Dropped,
}

impl From<&StanzaState> for StanzaStage {
    fn from(other: &StanzaState) -> Self {
        match other {
            StanzaState::Queued => Self::Queued,
            StanzaState::Sent => Self::Sent,
            StanzaState::Acked => Self::Acked,
            StanzaState::Failed { .. } => Self::Failed,
            StanzaState::Dropped => Self::Dropped,
        }
    }
}

impl PartialEq<StanzaStage> for StanzaState {
    fn eq(&self, other: &StanzaStage) -> bool {
        StanzaStage::from(self).eq(other)
    }
}

impl PartialOrd<StanzaStage> for StanzaState {
    fn partial_cmp(&self, other: &StanzaStage) -> Option<Ordering> {
        StanzaStage::from(self).partial_cmp(other)
    }
}

/// State of a stanza in transit to the peer.
#[derive(Debug, Clone)]
pub enum StanzaState {
    /// The stanza waits in the outbox.
    Queued,

    /// The stanza has been sent, but there is no proof that the server
    /// received it yet.
    Sent,

    /// The server confirmed reception.
    Acked,

    /// Sending the stanza has failed in a non-recoverable manner.
    Failed {
        /// The error which caused the sending to fail.
        error: OpaqueIoError,
    },

    /// The stanza was dropped.
    Dropped,
}

/// Track delivery of a stanza up to the peer.
#[derive(Debug, Clone)]
pub struct StanzaToken {
    inner: watch::Receiver<StanzaState>,
}

impl StanzaToken {
    /// Wait for the stanza delivery to reach the given stage.
    ///
    /// If the stanza is removed from tracking before that stage is reached,
    /// `None` is returned.
    pub async fn wait_for(&mut self, stage: StanzaStage) -> Option<StanzaState> {
        self.inner
            .wait_for(|st| *st >= stage)
            .await
            .map(|x| x.clone())
            .ok()
    }

    /// Stream of delivery state changes.
    pub fn into_stream(self) -> tokio_stream::wrappers::WatchStream<StanzaState> {
        tokio_stream::wrappers::WatchStream::new(self.inner)
    }

    /// Read the current delivery state.
    pub fn state(&self) -> StanzaState {
        self.inner.borrow().clone()
    }
}

/// An element on its way out, together with the sender side of its token.
pub(crate) struct QueueEntry {
    pub stanza: Element,
    pub token: watch::Sender<StanzaState>,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("name", &self.stanza.name())
            .field("id", &self.stanza.attr("id"))
            .field("state", &*self.token.borrow())
            .finish()
    }
}

impl QueueEntry {
    pub fn tracked(st: Element) -> (Self, StanzaToken) {
        let (tx, rx) = watch::channel(StanzaState::Queued);
        let token = StanzaToken { inner: rx };
        (
            QueueEntry {
                stanza: st,
                token: tx,
            },
            token,
        )
    }

    /// Whether the element counts towards the XEP-0198 counters.
    pub fn is_stanza(&self) -> bool {
        is_stanza(&self.stanza)
    }

    pub fn set_state(&self, state: StanzaState) {
        self.token.send_replace(state);
    }
}

/// Whether `elem` is a stanza (as opposed to a nonza like `<r/>`).
pub(crate) fn is_stanza(elem: &Element) -> bool {
    matches!(elem.name(), "iq" | "message" | "presence")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_follows_entry_state() {
        let elem: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
        let (entry, mut token) = QueueEntry::tracked(elem);
        assert!(token.state() == StanzaStage::Queued);

        entry.set_state(StanzaState::Sent);
        assert!(token.state() == StanzaStage::Sent);

        entry.set_state(StanzaState::Acked);
        let state = token.wait_for(StanzaStage::Acked).await;
        assert!(state.unwrap() == StanzaStage::Acked);
    }

    #[tokio::test]
    async fn dropped_entry_ends_wait() {
        let elem: Element = "<iq xmlns='jabber:client' type='get' id='x'/>".parse().unwrap();
        let (entry, mut token) = QueueEntry::tracked(elem);
        entry.set_state(StanzaState::Sent);
        drop(entry);
        assert!(token.wait_for(StanzaStage::Acked).await.is_none());
    }

    #[test]
    fn classifies_stanzas() {
        let r: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        let iq: Element = "<iq xmlns='jabber:client' type='get' id='x'/>".parse().unwrap();
        assert!(!is_stanza(&r));
        assert!(is_stanza(&iq));
        assert!(QueueEntry::tracked(iq).0.is_stanza());
    }
}
