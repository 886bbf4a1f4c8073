// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::collections::VecDeque;

use xmpp_parsers::sm;

use super::queue::{QueueEntry, StanzaState};

/// Lifecycle of stream management on the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmStatus {
    /// Not negotiated.
    Disabled,
    /// `<enable/>` was sent and the reply is outstanding. Stanzas are
    /// already counted and kept, as the peer counts from `<enable/>` on.
    Pending,
    /// Negotiated on a connection which is gone; counters and queue are kept
    /// for resumption.
    Inactive,
    /// Negotiated on the live connection.
    Active,
}

/// Counters, resumption data and unacked queue of a XEP-0198 session.
pub(crate) struct ResumptionContext {
    status: SmStatus,

    /// XEP-0198 stream ID
    id: Option<String>,

    /// Preferred IP and port for resumption as indicated by the peer.
    location: Option<String>,

    /// Resumption window preferred by the peer, in seconds.
    max: Option<u32>,

    /// Whether the peer allows resumption.
    resume: bool,

    /// Number of stanzas we sent.
    outgoing: u32,

    /// Number of stanzas we received.
    incoming: u32,

    /// Last value of `incoming` we reported to the peer.
    last_reported: Option<u32>,

    /// Unacked stanzas in the order they were sent
    // We push to the back and drain from the front, which is what VecDeque
    // is good at.
    unacked: VecDeque<QueueEntry>,
}

impl fmt::Debug for ResumptionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResumptionContext")
            .field("status", &self.status)
            .field("id", &self.id)
            .field("outgoing", &self.outgoing)
            .field("incoming", &self.incoming)
            .field("len(unacked)", &self.unacked.len())
            .finish()
    }
}

impl Default for ResumptionContext {
    fn default() -> Self {
        Self {
            status: SmStatus::Disabled,
            id: None,
            location: None,
            max: None,
            resume: false,
            outgoing: 0,
            incoming: 0,
            last_reported: None,
            unacked: VecDeque::new(),
        }
    }
}

/// Initialize stream management state
impl From<&sm::Enabled> for ResumptionContext {
    fn from(other: &sm::Enabled) -> Self {
        let mut state = Self::default();
        state.enabled(other);
        state
    }
}

impl ResumptionContext {
    /// State right after `<enable/>` went out.
    pub fn pending() -> Self {
        let mut state = Self::default();
        state.status = SmStatus::Pending;
        state
    }

    /// Apply `<enabled/>`, keeping whatever was counted while it was
    /// pending.
    pub fn enabled(&mut self, other: &sm::Enabled) {
        let resume = other.resume == sm::ResumeAttr::True;
        if resume && other.id.is_none() {
            log::warn!("peer replied with <enable resume='true'/>, but without an ID! cannot make this stream resumable.");
        }
        self.status = SmStatus::Active;
        self.id = other.id.as_ref().map(|id| id.0.clone());
        self.location = other.location.clone();
        self.max = other.max;
        self.resume = resume;
    }

    pub fn status(&self) -> SmStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SmStatus::Active
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    pub fn outgoing(&self) -> u32 {
        self.outgoing
    }

    pub fn incoming(&self) -> u32 {
        self.incoming
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Get the info necessary for resumption.
    ///
    /// Returns the stream ID and the current inbound counter if resumption is
    /// available and None otherwise.
    pub fn resume_info(&self) -> Option<(&str, u32)> {
        if !matches!(self.status, SmStatus::Active | SmStatus::Inactive) || !self.resume {
            return None;
        }
        Some((self.id.as_deref()?, self.incoming))
    }

    /// The connection went away.
    pub fn deactivate(&mut self) {
        if self.status == SmStatus::Active {
            self.status = SmStatus::Inactive;
        }
    }

    /// Count an outgoing stanza and keep it until it is acknowledged.
    pub fn on_outgoing(&mut self, entry: QueueEntry) {
        if self.status == SmStatus::Disabled || !entry.is_stanza() {
            return;
        }
        self.outgoing = self.outgoing.wrapping_add(1);
        if self.status == SmStatus::Inactive {
            return;
        }

        // The counters wrap at 2^32, and RFC 1982 serial number arithmetic
        // treats differences beyond half of that as negative. A longer queue
        // could not be told apart from a backwards ack.
        const MAX_QUEUE_SIZE: usize = (u32::MAX / 2 - 1) as usize;
        if self.unacked.len() >= MAX_QUEUE_SIZE {
            log::error!("Too many unacked stanzas, dropping the oldest one.");
            if let Some(oldest) = self.unacked.pop_front() {
                oldest.set_state(StanzaState::Dropped);
            }
        }

        self.unacked.push_back(entry);
        log::trace!(
            "Stored stanza in ResumptionContext. We are now at {} unacked stanzas.",
            self.unacked.len()
        );
    }

    /// Count an incoming stanza.
    pub fn on_incoming(&mut self) {
        if self.status != SmStatus::Active {
            return;
        }
        self.incoming = self.incoming.wrapping_add(1);
    }

    /// The value to put in an `<a/>`, if one should be sent.
    ///
    /// Unless forced, the counter is only reported if it changed since the
    /// last report.
    pub fn ack_to_send(&mut self, force: bool) -> Option<u32> {
        if self.status != SmStatus::Active {
            return None;
        }
        if !force && self.last_reported == Some(self.incoming) {
            return None;
        }
        self.last_reported = Some(self.incoming);
        Some(self.incoming)
    }

    /// Process remote `<a/>`.
    ///
    /// Everything but the `outgoing - h` most recent entries is confirmed.
    /// Returns the number of entries which were acknowledged by this call.
    pub fn remote_acked(&mut self, h: u32) -> usize {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        // XEP-0198 specifies that counters are mod 2^32, which is handy when
        // you use u32 data types :-).
        let unconfirmed = self.outgoing.wrapping_sub(h);
        if unconfirmed > u32::MAX / 2 {
            log::warn!(
                "remote acked more stanzas than we sent: remote counter = {}, local counter = {}",
                h,
                self.outgoing
            );
            return 0;
        }
        let unconfirmed = unconfirmed as usize;
        if unconfirmed >= self.unacked.len() {
            log::trace!("remote_acked: no stanzas to drop");
            return 0;
        }
        let to_drop = self.unacked.len() - unconfirmed;
        for entry in self.unacked.drain(..to_drop) {
            entry.set_state(StanzaState::Acked);
        }
        log::debug!("remote_acked: remote acked {to_drop} stanzas");
        to_drop
    }

    /// Process `<resumed/>`.
    ///
    /// Confirms what the peer has seen, resets the outgoing counter to `h`
    /// and returns the entries which need to be retransmitted, in order.
    pub fn resumed(&mut self, h: u32) -> Vec<QueueEntry> {
        self.remote_acked(h);
        self.outgoing = h;
        self.status = SmStatus::Active;
        // The peer has not seen the leftover queue (it got lost in the
        // previous unclean disconnect); it is sent again and counted anew.
        self.unacked.drain(..).collect()
    }

    /// Stop tracking the queue without touching the tokens: the stanzas
    /// went out on a live stream, there is just no proof they arrived.
    pub fn abandon(&mut self) -> usize {
        let untracked = self.unacked.len();
        self.unacked.clear();
        untracked
    }

    /// Discard the queue, marking every entry as dropped.
    ///
    /// Returns how many stanzas were lost.
    pub fn discard(&mut self) -> usize {
        let lost = self.unacked.len();
        for entry in self.unacked.drain(..) {
            entry.set_state(StanzaState::Dropped);
        }
        lost
    }
}

impl Drop for ResumptionContext {
    fn drop(&mut self) {
        let lost = self.discard();
        if lost > 0 {
            log::debug!("Dropped {} unacked stanzas with the resumption context.", lost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::queue::StanzaStage;
    use crate::sm::StanzaToken;
    use minidom::Element;

    fn enabled() -> ResumptionContext {
        let elem: Element = "<enabled xmlns='urn:xmpp:sm:3' id='some-long-sm-id' resume='true' max='600'/>"
            .parse()
            .unwrap();
        let enabled = sm::Enabled::try_from(elem).unwrap();
        ResumptionContext::from(&enabled)
    }

    fn send(ctx: &mut ResumptionContext, id: &str) -> StanzaToken {
        let elem: Element = format!("<message xmlns='jabber:client' id='{}'/>", id)
            .parse()
            .unwrap();
        let (entry, token) = QueueEntry::tracked(elem);
        ctx.on_outgoing(entry);
        token
    }

    #[test]
    fn enabled_stores_resumption_data() {
        let ctx = enabled();
        assert_eq!(ctx.status(), SmStatus::Active);
        assert_eq!(ctx.id(), Some("some-long-sm-id"));
        assert_eq!(ctx.max(), Some(600));
        assert_eq!(ctx.resume_info(), Some(("some-long-sm-id", 0)));
    }

    #[test]
    fn not_resumable_without_id() {
        let elem: Element = "<enabled xmlns='urn:xmpp:sm:3' resume='true'/>".parse().unwrap();
        let ctx = ResumptionContext::from(&sm::Enabled::try_from(elem).unwrap());
        assert!(ctx.is_active());
        assert_eq!(ctx.resume_info(), None);
    }

    #[test]
    fn ack_trims_oldest_entries() {
        let mut ctx = enabled();
        let t1 = send(&mut ctx, "1");
        let t2 = send(&mut ctx, "2");
        let t3 = send(&mut ctx, "3");
        assert_eq!(ctx.outgoing(), 3);

        assert_eq!(ctx.remote_acked(1), 1);
        assert_eq!(ctx.unacked_len(), 2);
        assert!(t1.state() == StanzaStage::Acked);
        assert!(t2.state() == StanzaStage::Queued);
        assert!(t3.state() == StanzaStage::Queued);
    }

    #[test]
    fn stale_and_excessive_acks_are_ignored() {
        let mut ctx = enabled();
        send(&mut ctx, "1");
        send(&mut ctx, "2");
        send(&mut ctx, "3");
        ctx.remote_acked(2);
        assert_eq!(ctx.unacked_len(), 1);

        // Duplicate and backwards acks change nothing.
        assert_eq!(ctx.remote_acked(2), 0);
        assert_eq!(ctx.remote_acked(1), 0);
        assert_eq!(ctx.unacked_len(), 1);

        // More than we ever sent.
        assert_eq!(ctx.remote_acked(10), 0);
        assert_eq!(ctx.unacked_len(), 1);

        assert_eq!(ctx.remote_acked(3), 1);
        assert_eq!(ctx.unacked_len(), 0);
    }

    #[test]
    fn counters_wrap() {
        let mut ctx = enabled();
        ctx.outgoing = u32::MAX;
        send(&mut ctx, "1");
        send(&mut ctx, "2");
        assert_eq!(ctx.outgoing(), 1);
        assert_eq!(ctx.remote_acked(0), 1);
        assert_eq!(ctx.unacked_len(), 1);
    }

    #[test]
    fn nonzas_are_not_counted() {
        let mut ctx = enabled();
        let r: Element = "<r xmlns='urn:xmpp:sm:3'/>".parse().unwrap();
        ctx.on_outgoing(QueueEntry::tracked(r).0);
        assert_eq!(ctx.outgoing(), 0);
        assert_eq!(ctx.unacked_len(), 0);
    }

    #[test]
    fn disabled_does_not_count() {
        let mut ctx = ResumptionContext::default();
        send(&mut ctx, "1");
        ctx.on_incoming();
        assert_eq!(ctx.outgoing(), 0);
        assert_eq!(ctx.incoming(), 0);
        assert_eq!(ctx.ack_to_send(true), None);
    }

    #[test]
    fn ack_reports_only_changes() {
        let mut ctx = enabled();
        assert_eq!(ctx.ack_to_send(false), Some(0));
        assert_eq!(ctx.ack_to_send(false), None);
        ctx.on_incoming();
        ctx.on_incoming();
        assert_eq!(ctx.ack_to_send(false), Some(2));
        assert_eq!(ctx.ack_to_send(false), None);
        assert_eq!(ctx.ack_to_send(true), Some(2));
    }

    #[test]
    fn resumed_returns_unacked_tail_in_order() {
        let mut ctx = enabled();
        send(&mut ctx, "1");
        send(&mut ctx, "2");
        send(&mut ctx, "3");
        ctx.deactivate();
        assert_eq!(ctx.status(), SmStatus::Inactive);
        assert!(ctx.resume_info().is_some());

        let resend = ctx.resumed(1);
        let ids: Vec<_> = resend
            .iter()
            .map(|entry| entry.stanza.attr("id").unwrap().to_owned())
            .collect();
        assert_eq!(ids, ["2", "3"]);
        assert_eq!(ctx.outgoing(), 1);
        assert_eq!(ctx.unacked_len(), 0);
        assert!(ctx.is_active());

        for entry in resend {
            ctx.on_outgoing(entry);
        }
        assert_eq!(ctx.outgoing(), 3);
        assert_eq!(ctx.unacked_len(), 2);
    }

    #[test]
    fn pending_counts_and_keeps_stanzas() {
        let mut ctx = ResumptionContext::pending();
        assert_eq!(ctx.resume_info(), None);
        let t1 = send(&mut ctx, "1");
        ctx.on_incoming();
        assert_eq!(ctx.outgoing(), 1);
        assert_eq!(ctx.incoming(), 0);
        assert_eq!(ctx.ack_to_send(true), None);

        let elem: Element = "<enabled xmlns='urn:xmpp:sm:3' id='sm-2' resume='true'/>"
            .parse()
            .unwrap();
        ctx.enabled(&sm::Enabled::try_from(elem).unwrap());
        assert!(ctx.is_active());
        let t2 = send(&mut ctx, "2");
        assert_eq!(ctx.remote_acked(2), 2);
        assert!(t1.state() == StanzaStage::Acked);
        assert!(t2.state() == StanzaStage::Acked);
        assert_eq!(ctx.resume_info(), Some(("sm-2", 0)));
    }

    #[test]
    fn abandon_keeps_tokens() {
        let mut ctx = ResumptionContext::pending();
        let token = send(&mut ctx, "1");
        assert_eq!(ctx.abandon(), 1);
        drop(ctx);
        assert!(token.state() == StanzaStage::Queued);
    }

    #[test]
    fn discard_drops_tokens() {
        let mut ctx = enabled();
        let token = send(&mut ctx, "1");
        assert_eq!(ctx.discard(), 1);
        assert!(token.state() == StanzaStage::Dropped);
    }
}
