//! Response routing for the persistent connection
//!
//! Exactly one caller turn is active at a time. Raw events from the
//! connection are transformed and pushed to that turn's sink; session
//! events are reported into the `SessionTracker`; a turn end releases the
//! message channel for the next queued input.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vaultpilot_protocol::{new_id, AgentEvent, OutboundMessage, StreamChunk};

use crate::channel::MessageChannel;
use crate::session::SessionTracker;
use crate::transform::{transform, Transformed, TurnFlags};

pub type ChunkSender = mpsc::UnboundedSender<StreamChunk>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("a response is already in progress")]
    TurnInProgress,
}

/// What to do about a transport failure.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    /// Nothing reached the caller yet; restart and resend this message.
    Replay(OutboundMessage),
    /// The error went to the caller as a terminal chunk.
    Surfaced,
    /// No turn was in flight.
    Idle,
}

struct ResponseHandler {
    id: String,
    tx: ChunkSender,
    outbound: OutboundMessage,
    flags: TurnFlags,
    crash_recovery_attempted: bool,
    /// Registered through a `TurnClaim`; the slot returns to that claim
    /// when the turn ends.
    claimed: bool,
}

impl ResponseHandler {
    fn deliver(&self, chunk: StreamChunk) {
        if self.tx.send(chunk).is_err() {
            debug!(
                component = "router",
                event = "router.receiver_dropped",
                handler_id = %self.id,
            );
        }
    }
}

#[derive(Default)]
enum Slot {
    #[default]
    Idle,
    /// A caller owns the next turn but has not sent its message yet.
    Claimed(String),
    Active(ResponseHandler),
}

impl Slot {
    fn handler(&self) -> Option<&ResponseHandler> {
        match self {
            Slot::Active(handler) => Some(handler),
            Slot::Idle | Slot::Claimed(_) => None,
        }
    }

    /// Remove the active handler, handing the slot back to its claim.
    fn take_handler(&mut self) -> Option<ResponseHandler> {
        if !matches!(self, Slot::Active(_)) {
            return None;
        }
        match std::mem::take(self) {
            Slot::Active(handler) => {
                if handler.claimed {
                    *self = Slot::Claimed(handler.id.clone());
                }
                Some(handler)
            }
            other => {
                *self = other;
                None
            }
        }
    }
}

#[derive(Default)]
pub struct ResponseRouter {
    slot: Mutex<Slot>,
}

/// Exclusive right to run the next turn. Held from before the connection
/// is prepared until the caller has seen its terminal chunk; dropping it
/// frees the router for the next caller.
pub struct TurnClaim<'a> {
    router: &'a ResponseRouter,
    id: String,
}

impl TurnClaim<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start routing chunks of the turn `outbound` begins to `tx`.
    pub fn activate(
        &self,
        tx: ChunkSender,
        outbound: OutboundMessage,
    ) -> Result<(), RouterError> {
        let mut slot = self.router.lock();
        if !matches!(&*slot, Slot::Claimed(id) if *id == self.id) {
            return Err(RouterError::TurnInProgress);
        }
        debug!(
            component = "router",
            event = "router.handler_registered",
            handler_id = %self.id,
        );
        *slot = Slot::Active(ResponseHandler {
            id: self.id.clone(),
            tx,
            outbound,
            flags: TurnFlags::default(),
            crash_recovery_attempted: false,
            claimed: true,
        });
        Ok(())
    }
}

impl Drop for TurnClaim<'_> {
    fn drop(&mut self) {
        let mut slot = self.router.lock();
        if matches!(&*slot, Slot::Claimed(id) if *id == self.id) {
            *slot = Slot::Idle;
            return;
        }
        // Turn still running; it frees the slot itself when it ends
        if let Slot::Active(handler) = &mut *slot {
            if handler.id == self.id {
                handler.claimed = false;
            }
        }
    }
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve the next turn before touching the connection.
    pub fn claim(&self) -> Result<TurnClaim<'_>, RouterError> {
        let mut slot = self.lock();
        if !matches!(&*slot, Slot::Idle) {
            return Err(RouterError::TurnInProgress);
        }
        let id = new_id();
        *slot = Slot::Claimed(id.clone());
        Ok(TurnClaim { router: self, id })
    }

    /// Register the sink for the turn `outbound` is about to start.
    pub fn register(
        &self,
        tx: ChunkSender,
        outbound: OutboundMessage,
    ) -> Result<String, RouterError> {
        let mut slot = self.lock();
        if !matches!(&*slot, Slot::Idle) {
            return Err(RouterError::TurnInProgress);
        }
        let id = new_id();
        debug!(
            component = "router",
            event = "router.handler_registered",
            handler_id = %id,
        );
        *slot = Slot::Active(ResponseHandler {
            id: id.clone(),
            tx,
            outbound,
            flags: TurnFlags::default(),
            crash_recovery_attempted: false,
            claimed: false,
        });
        Ok(id)
    }

    /// Drop the handler if it is still the active one.
    pub fn unregister(&self, handler_id: &str) {
        let mut slot = self.lock();
        if slot.handler().is_some_and(|h| h.id == handler_id) {
            slot.take_handler();
        }
    }

    /// Whether a turn is streaming. A claim that has not sent its message
    /// yet does not count.
    pub fn is_active(&self) -> bool {
        self.lock().handler().is_some()
    }

    pub fn route(
        &self,
        event: AgentEvent,
        session: &Mutex<SessionTracker>,
        channel: &MessageChannel,
    ) {
        let mut slot = self.lock();
        let mut scratch = TurnFlags::default();
        let flags = match &mut *slot {
            Slot::Active(handler) => &mut handler.flags,
            Slot::Idle | Slot::Claimed(_) => &mut scratch,
        };

        match transform(event, flags) {
            Transformed::Session { session_id, model } => {
                capture(session, &session_id, model.as_deref());
                channel.set_session_id(&session_id);
            }
            Transformed::Chunk(chunk) => match slot.handler() {
                Some(handler) => handler.deliver(chunk),
                None => debug!(
                    component = "router",
                    event = "router.chunk_without_handler",
                    "Dropping chunk with no active handler"
                ),
            },
            Transformed::Suppressed => {}
            Transformed::TurnComplete { usage, session_id } => {
                if let Some(session_id) = session_id {
                    capture(session, &session_id, None);
                    channel.set_session_id(&session_id);
                }
                if let Some(handler) = slot.take_handler() {
                    if let Some(usage) = usage {
                        handler.deliver(StreamChunk::Usage { usage });
                    }
                    handler.deliver(StreamChunk::Done);
                    debug!(
                        component = "router",
                        event = "router.turn_complete",
                        handler_id = %handler.id,
                    );
                }
                channel.on_turn_complete();
            }
            Transformed::TurnFailed { message } => {
                if let Some(handler) = slot.take_handler() {
                    info!(
                        component = "router",
                        event = "router.turn_failed",
                        handler_id = %handler.id,
                        error = %message,
                    );
                    handler.deliver(StreamChunk::error(message));
                }
                channel.on_turn_complete();
            }
        }
    }

    /// Decide between a silent replay and surfacing the failure.
    pub fn on_transport_failure(&self, message: &str) -> TransportOutcome {
        let mut slot = self.lock();
        let Slot::Active(handler) = &mut *slot else {
            return TransportOutcome::Idle;
        };

        if !handler.flags.saw_any_chunk && !handler.crash_recovery_attempted {
            handler.crash_recovery_attempted = true;
            handler.flags.reset();
            warn!(
                component = "router",
                event = "router.crash_recovery",
                handler_id = %handler.id,
                error = %message,
                "Connection failed before any output; replaying message"
            );
            return TransportOutcome::Replay(handler.outbound.clone());
        }

        if let Some(handler) = slot.take_handler() {
            handler.deliver(StreamChunk::error(message));
        }
        TransportOutcome::Surfaced
    }

    /// Terminate the active turn, if any, with an error chunk. A claim
    /// that has not started its turn is left alone.
    pub fn fail_active(&self, message: &str) {
        if let Some(handler) = self.lock().take_handler() {
            debug!(
                component = "router",
                event = "router.handler_failed",
                handler_id = %handler.id,
                error = %message,
            );
            handler.deliver(StreamChunk::error(message));
        }
    }
}

fn capture(session: &Mutex<SessionTracker>, session_id: &str, model: Option<&str>) {
    session
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .capture_session(session_id, model);
}
