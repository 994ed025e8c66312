//! vaultpilot connectors
//!
//! The boundary between the orchestration core and an out-of-process
//! agent. `connection` defines the traits the core drives; `claude`
//! implements them over the Claude CLI's stream-json protocol.

pub mod binary;
pub mod claude;
pub mod connection;
pub mod permission;

pub use binary::resolve_claude_binary;
pub use claude::ClaudeCliLauncher;
pub use connection::{
    AgentConnection, AgentLauncher, EventStream, InputStream, LaunchConfig, LaunchedAgent,
};
pub use permission::ToolPermissionHandler;
use thiserror::Error;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Agent connection closed: {0}")]
    TransportClosed(String),

    #[error("Control request rejected: {0}")]
    ControlRejected(String),

    #[error("Control request timed out after {0}s")]
    ControlTimeout(u64),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Provider error: {0}")]
    ProviderError(String),
}

impl ConnectorError {
    /// Whether the agent reported that the resumed conversation no longer exists.
    pub fn is_session_expired(&self) -> bool {
        match self {
            ConnectorError::SessionExpired(_) => true,
            ConnectorError::ProviderError(msg)
            | ConnectorError::TransportClosed(msg)
            | ConnectorError::ControlRejected(msg) => is_session_expired_message(msg),
            _ => false,
        }
    }
}

/// Recognize the agent's "conversation is gone" error text.
pub fn is_session_expired_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no conversation found")
        || lower.contains("session not found")
        || lower.contains("session expired")
        || lower.contains("session has expired")
}
