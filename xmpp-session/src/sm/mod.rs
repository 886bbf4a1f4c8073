// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0198 Stream Management.
//!
//! The [`StreamManagementModule`] negotiates stream management, answers and
//! requests acks and resumes a previous session. Its state (counters and the
//! queue of unacknowledged stanzas) lives in the [`SessionObject`] with
//! [`Scope::Session`], so it survives the loss of the transport when the
//! session can be resumed.

use minidom::Element;
use xmpp_parsers::sm;
use xmpp_parsers::stanza_error::DefinedCondition;

use crate::context::Context;
use crate::error::{parse, Error, ProtocolError};
use crate::event::{Event, StreamManagementEvent};
use crate::modules::{Criteria, ModuleDescriptor, ModuleProvider, XmppModule};
use crate::modules::stream::StreamFeaturesModule;
use crate::ns;
use crate::store::{Scope, SessionObject};

mod queue;
mod state;

pub use queue::{OpaqueIoError, StanzaStage, StanzaState, StanzaToken};
pub(crate) use queue::{is_stanza, QueueEntry};
pub(crate) use state::ResumptionContext;
pub use state::SmStatus;

const SM_STATE: &str = "sm-state";

/// Count an incoming element if stream management is on.
pub(crate) fn observe_incoming(session: &mut SessionObject, element: &Element) {
    if !is_stanza(element) {
        return;
    }
    if let Some(state) = session.get_mut::<ResumptionContext>(SM_STATE) {
        state.on_incoming();
    }
}

/// Count an element the transport accepted, keeping it until it is acked.
///
/// The peer counts our stanzas from `<enable/>` on, so that is where
/// counting starts too.
pub(crate) fn observe_outgoing(session: &mut SessionObject, entry: QueueEntry) {
    if entry.stanza.is("enable", ns::SM) {
        session.set(Scope::Session, SM_STATE, ResumptionContext::pending());
        return;
    }
    if let Some(state) = session.get_mut::<ResumptionContext>(SM_STATE) {
        state.on_outgoing(entry);
    }
}

/// Start counting after the server enabled stream management, either in
/// reply to `<enable/>` or inline during SASL2 bind.
pub(crate) fn apply_enabled(ctx: &mut Context, enabled: sm::Enabled) {
    let promoted = match ctx.session.get_mut::<ResumptionContext>(SM_STATE) {
        Some(state) if state.status() == SmStatus::Pending => {
            state.enabled(&enabled);
            true
        }
        _ => false,
    };
    if !promoted {
        ctx.session
            .set(Scope::Session, SM_STATE, ResumptionContext::from(&enabled));
    }
    let Some(state) = ctx.session.get::<ResumptionContext>(SM_STATE) else {
        return;
    };
    let event = StreamManagementEvent::Enabled {
        id: state.id().map(ToOwned::to_owned),
        resume: state.resume_info().is_some(),
        max: state.max(),
    };
    log::info!(
        "stream management enabled (id={:?}, location={:?}, max={:?})",
        state.id(),
        state.location(),
        state.max()
    );
    ctx.fire(Event::StreamManagement(event));
}

/// Read `<failed/>` without insisting on a schema: servers put the error
/// condition and `h` there in various shapes.
fn parse_failed(element: &Element) -> (Option<u32>, Option<DefinedCondition>) {
    let h = element.attr("h").and_then(|h| match h.parse::<u32>() {
        Ok(h) => Some(h),
        Err(e) => {
            log::warn!("ignoring invalid h={:?} in <failed/>: {}", h, e);
            None
        }
    });
    let condition = element
        .children()
        .filter(|child| child.has_ns(ns::XMPP_STANZAS) && child.name() != "text")
        .find_map(|child| DefinedCondition::try_from(child.clone()).ok());
    (h, condition)
}

/// XEP-0198 negotiation, acks and resumption.
#[derive(Debug, Default)]
pub struct StreamManagementModule;

impl StreamManagementModule {
    fn state<'c>(ctx: &'c Context) -> Option<&'c ResumptionContext> {
        ctx.session.get(SM_STATE)
    }

    fn state_mut<'c>(ctx: &'c mut Context) -> Option<&'c mut ResumptionContext> {
        ctx.session.get_mut(SM_STATE)
    }

    /// Current status of stream management.
    pub fn status(&self, ctx: &Context) -> SmStatus {
        Self::state(ctx).map_or(SmStatus::Disabled, ResumptionContext::status)
    }

    /// Whether the previous session can be resumed: stream management was
    /// enabled with resumption and the server gave us a stream id.
    pub fn is_resumption_available(&self, ctx: &Context) -> bool {
        Self::state(ctx).is_some_and(|state| state.resume_info().is_some())
    }

    /// Number of sent stanzas the server has not acknowledged yet.
    pub fn unacked(&self, ctx: &Context) -> usize {
        Self::state(ctx).map_or(0, ResumptionContext::unacked_len)
    }

    /// Ask the server to enable stream management with resumption.
    ///
    /// Returns false if it is disabled in the configuration or the server
    /// does not offer it.
    pub fn enable(&mut self, ctx: &mut Context) -> bool {
        if !ctx.config.stream_management {
            return false;
        }
        if ctx.session.stream_feature("sm", ns::SM).is_none() {
            log::debug!("server does not support stream management");
            return false;
        }
        let mut enable = sm::Enable::new().with_resume();
        if let Some(max) = ctx.config.sm_max {
            enable = enable.with_max(max);
        }
        log::debug!("enabling stream management");
        ctx.write_directly(enable.into());
        true
    }

    /// Ask the server to resume the previous session.
    pub fn resume(&mut self, ctx: &mut Context) -> bool {
        let Some((previd, h)) = Self::state(ctx)
            .and_then(ResumptionContext::resume_info)
            .map(|(id, h)| (id.to_owned(), h))
        else {
            return false;
        };
        log::debug!("resuming stream {} at h={}", previd, h);
        ctx.write_directly(
            sm::Resume {
                h,
                previd: sm::StreamId(previd),
            }
            .into(),
        );
        true
    }

    /// Send `<r/>`.
    pub fn request_ack(&mut self, ctx: &mut Context) {
        if Self::state(ctx).is_some_and(ResumptionContext::is_active) {
            ctx.write_directly(sm::R.into());
        }
    }

    /// Send `<a/>` if the incoming counter changed since the last report,
    /// or unconditionally if `force` is set.
    pub fn send_ack(&mut self, ctx: &mut Context, force: bool) {
        if let Some(h) = Self::state_mut(ctx).and_then(|state| state.ack_to_send(force)) {
            ctx.write_directly(sm::A::new(h).into());
        }
    }

    /// Periodic housekeeping: request an ack while stanzas are pending and
    /// report our own counter.
    pub fn on_tick(&mut self, ctx: &mut Context) {
        let Some(state) = Self::state(ctx) else {
            return;
        };
        if !state.is_active() {
            return;
        }
        if state.unacked_len() > 0 {
            self.request_ack(ctx);
        }
        self.send_ack(ctx, false);
    }

    /// Forget the stream management session without telling the server.
    /// Unacknowledged stanzas are dropped.
    pub fn reset(&mut self, ctx: &mut Context) {
        if ctx.session.remove::<ResumptionContext>(SM_STATE).is_some() {
            log::debug!("stream management state reset");
        }
    }

    /// The transport went away; keep the state around for resumption.
    pub fn deactivate(&mut self, ctx: &mut Context) {
        if let Some(state) = Self::state_mut(ctx) {
            log::debug!(
                "stream management suspended at outgoing={}, incoming={}",
                state.outgoing(),
                state.incoming()
            );
            state.deactivate();
        }
    }

    fn on_resumed(&mut self, ctx: &mut Context, resumed: sm::Resumed) -> Result<(), Error> {
        let Some(state) = Self::state_mut(ctx) else {
            log::warn!("received <resumed/> without a session to resume");
            return Err(ProtocolError::UnexpectedElement(String::from("resumed")).into());
        };
        let resend = state.resumed(resumed.h);
        log::info!(
            "stream {} resumed, retransmitting {} stanzas",
            resumed.previd.0,
            resend.len()
        );
        for entry in resend {
            ctx.resend(entry);
        }
        ctx.fire(Event::StreamManagement(StreamManagementEvent::Resumed {
            h: resumed.h,
            prev_id: resumed.previd.0,
        }));
        Ok(())
    }

    fn on_failed(&mut self, ctx: &mut Context, element: &Element) {
        let (h, condition) = parse_failed(element);
        if let Some(mut state) = ctx.session.remove::<ResumptionContext>(SM_STATE) {
            if state.status() == SmStatus::Pending {
                // The stream itself is fine; delivery just cannot be
                // confirmed anymore.
                let untracked = state.abandon();
                log::debug!("stopped tracking {} stanzas sent while enabling", untracked);
            } else {
                if let Some(h) = h {
                    state.remote_acked(h);
                }
                let lost = state.discard();
                if lost > 0 {
                    log::warn!(
                        "stream management failed, {} unacknowledged stanzas are lost",
                        lost
                    );
                }
            }
        }
        log::info!("stream management failed: {:?}", condition);
        ctx.fire(Event::StreamManagement(StreamManagementEvent::Failed(
            condition,
        )));
    }
}

impl XmppModule for StreamManagementModule {
    fn criteria(&self) -> Option<Criteria> {
        Some(Criteria::xmlns(ns::SM))
    }

    fn process(&mut self, ctx: &mut Context, element: &Element) -> Result<(), Error> {
        match element.name() {
            "enabled" => apply_enabled(ctx, parse(element)?),
            "resumed" => self.on_resumed(ctx, parse(element)?)?,
            "failed" => self.on_failed(ctx, element),
            "a" => {
                let ack: sm::A = parse(element)?;
                match Self::state_mut(ctx) {
                    Some(state) => {
                        state.remote_acked(ack.h);
                    }
                    None => log::warn!("received <a/> but stream management is not enabled"),
                }
            }
            "r" => self.send_ack(ctx, true),
            other => return Err(ProtocolError::UnexpectedElement(other.to_owned()).into()),
        }
        Ok(())
    }
}

impl ModuleProvider for StreamManagementModule {
    const NAME: &'static str = "stream-management";

    fn requires() -> Vec<fn() -> ModuleDescriptor> {
        vec![ModuleDescriptor::new::<StreamFeaturesModule>]
    }
}
