//! vaultpilot
//!
//! Orchestration core for a long-lived agent connection shared across many
//! conversational turns: message queueing, response routing, session
//! tracking, connection lifecycle and cold-start fallback.

pub mod channel;
pub mod cold_start;
pub mod config;
pub mod history;
pub mod lifecycle;
pub mod logging;
pub mod permission;
pub mod query;
pub mod readiness;
pub mod router;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelError, EnqueueOutcome, MessageChannel};
pub use config::{Settings, SettingsSource, SharedSettings};
pub use lifecycle::{ConnectionManager, EnsureReadyOptions, LifecycleError};
pub use permission::{ApproveAll, PermissionGate, PermissionHandler};
pub use query::{QueryOptions, QueryRequest};
pub use service::AgentService;
pub use session::SessionTracker;
