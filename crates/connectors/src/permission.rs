//! Tool permission callback invoked by a connection when the agent asks
//! to run a tool.

use async_trait::async_trait;
use vaultpilot_protocol::{PermissionDecision, ToolPermissionRequest};

/// Infallible by contract: implementations fold their own failures into a
/// `Deny` so a connection never has to guess.
#[async_trait]
pub trait ToolPermissionHandler: Send + Sync {
    async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision;
}

/// Allows everything. Used when the agent runs in bypass mode or in tests.
pub struct AllowAll;

#[async_trait]
impl ToolPermissionHandler for AllowAll {
    async fn can_use_tool(&self, _request: ToolPermissionRequest) -> PermissionDecision {
        PermissionDecision::Allow
    }
}
