//! Disposable single-turn connections
//!
//! Used when the persistent connection is unavailable, has lost its
//! session, or the caller wants an isolated turn. Each run launches its
//! own connection, feeds it one message, streams the turn and tears the
//! connection down whatever happens.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vaultpilot_connectors::{is_session_expired_message, AgentLauncher, ToolPermissionHandler};
use vaultpilot_protocol::{ImageAttachment, OutboundMessage, StreamChunk};

use crate::channel::MessageChannel;
use crate::router::ChunkSender;
use crate::snapshot::DesiredConnection;
use crate::transform::{transform, Transformed, TurnFlags};

const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

pub struct ColdStartRequest {
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
    pub desired: DesiredConnection,
    pub resume_session_id: Option<String>,
    pub permission: Arc<dyn ToolPermissionHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdStartOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl ColdStartOutcome {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ColdStartOutcome::Failed(message) if is_session_expired_message(message))
    }
}

#[derive(Debug)]
pub struct ColdStartResult {
    pub outcome: ColdStartOutcome,
    /// Session the agent established, if it got that far.
    pub session_id: Option<String>,
    /// Whether any content chunk reached the caller.
    pub delivered_content: bool,
}

impl ColdStartResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: ColdStartOutcome::Failed(message.into()),
            session_id: None,
            delivered_content: false,
        }
    }
}

/// Run one turn on a fresh connection, forwarding content and usage
/// chunks to `tx`. The caller sends the terminal chunk.
pub async fn run_cold_start(
    launcher: &dyn AgentLauncher,
    request: ColdStartRequest,
    cancel: &CancellationToken,
    tx: &ChunkSender,
) -> ColdStartResult {
    let channel = MessageChannel::default();
    if let Some(session_id) = request.resume_session_id.as_deref() {
        channel.set_session_id(session_id);
    }
    if let Err(e) = channel.enqueue(OutboundMessage::with_images(
        request.prompt,
        request.images,
    )) {
        return ColdStartResult::failed(e.to_string());
    }

    let abort = cancel.child_token();
    let config = request.desired.launch_config(
        request.resume_session_id.clone(),
        request.permission,
        abort.clone(),
    );
    info!(
        component = "cold_start",
        event = "cold_start.launch",
        resume = ?request.resume_session_id,
        model = ?request.desired.snapshot.model,
    );

    let mut launched = match launcher.launch(config, channel.stream()).await {
        Ok(launched) => launched,
        Err(e) => {
            warn!(
                component = "cold_start",
                event = "cold_start.launch_failed",
                error = %e,
            );
            abort.cancel();
            channel.close();
            return ColdStartResult::failed(e.to_string());
        }
    };

    let mut flags = TurnFlags::default();
    let mut session_id = None;
    let mut delivered_content = false;

    let outcome = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(INTERRUPT_GRACE, launched.connection.interrupt()).await;
                break ColdStartOutcome::Cancelled;
            }
            item = launched.events.recv() => item,
        };

        let event = match item {
            Some(Ok(event)) => event,
            Some(Err(e)) => break ColdStartOutcome::Failed(e.to_string()),
            None => {
                break ColdStartOutcome::Failed(
                    "Agent connection closed before the response finished".to_string(),
                )
            }
        };

        match transform(event, &mut flags) {
            Transformed::Session { session_id: id, .. } => session_id = Some(id),
            Transformed::Chunk(chunk) => {
                delivered_content |= chunk.is_content();
                let _ = tx.send(chunk);
            }
            Transformed::Suppressed => {}
            Transformed::TurnComplete {
                usage,
                session_id: id,
            } => {
                if id.is_some() {
                    session_id = id;
                }
                if let Some(usage) = usage {
                    let _ = tx.send(StreamChunk::Usage { usage });
                }
                break ColdStartOutcome::Completed;
            }
            Transformed::TurnFailed { message } => break ColdStartOutcome::Failed(message),
        }
    };

    channel.close();
    abort.cancel();
    launched.connection.abort();
    debug!(
        component = "cold_start",
        event = "cold_start.finished",
        outcome = ?outcome,
        session_id = ?session_id,
    );

    ColdStartResult {
        outcome,
        session_id,
        delivered_content,
    }
}
