//! Message channel feeding the persistent agent connection.
//!
//! User input is queued here and read by exactly one consumer (the
//! connection's input pump). A message handed to the consumer starts a
//! turn; nothing else leaves the channel until `on_turn_complete()`.
//! Input arriving mid-turn is merged: text into one pending text slot,
//! attachments into one pending attachment slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use vaultpilot_protocol::{MessageContent, OutboundMessage};

/// Maximum number of distinct queued slots.
pub const MAX_QUEUED_MESSAGES: usize = 8;
/// Maximum length, in characters, of merged text.
pub const MAX_MERGED_CHARS: usize = 12_000;

const MERGE_SEPARATOR: &str = "\n\n";

/// Receives non-fatal channel diagnostics (drops, replacements).
pub type DiagnosticSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("message channel is closed")]
    Closed,
}

/// What `enqueue` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed straight to a waiting consumer.
    Delivered,
    /// Stored in its own slot.
    Queued,
    /// Appended to the pending text slot.
    Merged,
    /// Took the place of a pending attachment.
    Replaced,
    /// Rejected by a queue or merge limit.
    Dropped,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<MessageContent>,
    turn_active: bool,
    closed: bool,
    session_id: String,
    waiter: Option<oneshot::Sender<Option<OutboundMessage>>>,
}

impl ChannelState {
    fn stamp(&self, content: MessageContent) -> OutboundMessage {
        OutboundMessage {
            session_id: self.session_id.clone(),
            content,
        }
    }

    /// Hand the front of the queue to the blocked consumer, if both exist.
    fn deliver_to_waiter(&mut self) -> bool {
        if self.turn_active || self.queue.is_empty() {
            return false;
        }
        let Some(waiter) = self.waiter.take() else {
            return false;
        };
        let Some(content) = self.queue.pop_front() else {
            return false;
        };
        let msg = self.stamp(content);
        match waiter.send(Some(msg)) {
            Ok(()) => {
                self.turn_active = true;
                true
            }
            Err(returned) => {
                // Reader went away; keep the message for the next one
                if let Some(msg) = returned {
                    self.queue.push_front(msg.content);
                }
                false
            }
        }
    }

    /// Mid-turn arrival: merge or replace instead of taking a new slot.
    fn merge(&mut self, content: MessageContent) -> (EnqueueOutcome, Option<String>) {
        match content {
            MessageContent::Attachment { .. } => {
                if let Some(slot) = self.queue.iter_mut().find(|c| c.is_attachment()) {
                    *slot = content;
                    return (
                        EnqueueOutcome::Replaced,
                        Some("Replaced a queued attachment message with a newer one".to_string()),
                    );
                }
                self.push_slot(content)
            }
            MessageContent::Text { text } => {
                let pending = self.queue.iter_mut().find_map(|c| match c {
                    MessageContent::Text { text } => Some(text),
                    MessageContent::Attachment { .. } => None,
                });
                match pending {
                    Some(existing) => {
                        let merged_len = existing.chars().count()
                            + MERGE_SEPARATOR.len()
                            + text.chars().count();
                        if merged_len > MAX_MERGED_CHARS {
                            return (
                                EnqueueOutcome::Dropped,
                                Some(format!(
                                    "Dropped queued message: merged text would exceed {} characters",
                                    MAX_MERGED_CHARS
                                )),
                            );
                        }
                        existing.push_str(MERGE_SEPARATOR);
                        existing.push_str(&text);
                        (EnqueueOutcome::Merged, None)
                    }
                    None => self.push_slot(MessageContent::Text { text }),
                }
            }
        }
    }

    fn push_slot(&mut self, content: MessageContent) -> (EnqueueOutcome, Option<String>) {
        if self.queue.len() >= MAX_QUEUED_MESSAGES {
            return (
                EnqueueOutcome::Dropped,
                Some(format!(
                    "Dropped message: queue already holds {} messages",
                    MAX_QUEUED_MESSAGES
                )),
            );
        }
        self.queue.push_back(content);
        (EnqueueOutcome::Queued, None)
    }
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct MessageChannel {
    state: Arc<Mutex<ChannelState>>,
    diagnostics: DiagnosticSink,
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new(Arc::new(|_: &str| {}))
    }
}

impl MessageChannel {
    pub fn new(diagnostics: DiagnosticSink) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState::default())),
            diagnostics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, message: &str) {
        warn!(
            component = "message_channel",
            event = "channel.diagnostic",
            message = %message,
            "Message channel dropped or replaced input"
        );
        (self.diagnostics)(message);
    }

    /// Accept new input. Never blocks.
    pub fn enqueue(&self, msg: OutboundMessage) -> Result<EnqueueOutcome, ChannelError> {
        let (outcome, diagnostic) = {
            let mut state = self.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }

            if state.turn_active {
                state.merge(msg.content)
            } else {
                match state.push_slot(msg.content) {
                    (EnqueueOutcome::Queued, None) if state.deliver_to_waiter() => {
                        (EnqueueOutcome::Delivered, None)
                    }
                    other => other,
                }
            }
        };

        if let Some(message) = diagnostic {
            self.emit(&message);
        }
        debug!(
            component = "message_channel",
            event = "channel.enqueue",
            outcome = ?outcome,
            "Message enqueued"
        );
        Ok(outcome)
    }

    /// Wait for the next message. `None` once the channel is closed and drained.
    pub async fn next(&self) -> Option<OutboundMessage> {
        let rx = {
            let mut state = self.lock();
            if !state.turn_active {
                if let Some(content) = state.queue.pop_front() {
                    state.turn_active = true;
                    return Some(state.stamp(content));
                }
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            rx
        };
        rx.await.unwrap_or(None)
    }

    /// The channel as a stream, for handing to a connection.
    pub fn stream(&self) -> BoxStream<'static, OutboundMessage> {
        stream::unfold(self.clone(), |channel| async move {
            let msg = channel.next().await?;
            Some((msg, channel))
        })
        .boxed()
    }

    /// Stamp subsequently delivered messages with this conversation id.
    pub fn set_session_id(&self, session_id: &str) {
        self.lock().session_id = session_id.to_string();
    }

    /// The previous turn finished; release the next pending message.
    pub fn on_turn_complete(&self) {
        let mut state = self.lock();
        state.turn_active = false;
        state.deliver_to_waiter();
    }

    /// Close for good, dropping queued input and waking a blocked reader.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.turn_active = false;
        state.queue.clear();
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(None);
        }
    }

    /// Drop queued input and the turn flag without closing. The session
    /// stamp and any blocked reader are kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.turn_active = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_turn_active(&self) -> bool {
        self.lock().turn_active
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }
}
