//! vaultpilot protocol
//!
//! Shared types passed between the orchestration core, the agent
//! connectors and the host application. Nothing here performs IO.

use uuid::Uuid;

pub mod chunk;
pub mod event;
pub mod types;

pub use chunk::StreamChunk;
pub use event::AgentEvent;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
