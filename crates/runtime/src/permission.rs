//! Tool permission gate
//!
//! Sits between a connection's `can_use_tool` callback and the host's
//! permission prompt. Checks run in order: the per-turn tool restriction,
//! the blocked shell command list, then the host handler. A failing host
//! handler denies the call.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::{info, warn};
use vaultpilot_connectors::ToolPermissionHandler;
use vaultpilot_protocol::{PermissionDecision, ToolPermissionRequest};

use crate::config::SettingsSource;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The host's permission prompt.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn request_permission(
        &self,
        request: &ToolPermissionRequest,
    ) -> Result<PermissionDecision, HandlerError>;
}

pub struct PermissionGate {
    allowed_tools: ArcSwapOption<Vec<String>>,
    settings: Arc<dyn SettingsSource>,
    handler: Arc<dyn PermissionHandler>,
}

impl PermissionGate {
    pub fn new(settings: Arc<dyn SettingsSource>, handler: Arc<dyn PermissionHandler>) -> Self {
        Self {
            allowed_tools: ArcSwapOption::empty(),
            settings,
            handler,
        }
    }

    /// Restrict the current turn to `tools`; `None` lifts the restriction.
    pub fn set_allowed_tools(&self, tools: Option<Vec<String>>) {
        self.allowed_tools.store(tools.map(Arc::new));
    }

    /// A gate with its own restriction, sharing the settings and host handler.
    pub fn scoped(&self, tools: Option<Vec<String>>) -> Self {
        let gate = Self::new(self.settings.clone(), self.handler.clone());
        gate.set_allowed_tools(tools);
        gate
    }

    fn restriction_denial(&self, tool_name: &str) -> Option<String> {
        let allowed = self.allowed_tools.load_full()?;
        if allowed.iter().any(|t| t == tool_name) {
            return None;
        }
        Some(format!("Tool {} is not allowed for this request", tool_name))
    }

    fn blocked_command(&self, request: &ToolPermissionRequest) -> Option<String> {
        if request.tool_name != "Bash" {
            return None;
        }
        let command = request.input.get("command")?.as_str()?;
        let settings = self.settings.current();
        settings
            .blocked_commands
            .iter()
            .filter(|pattern| !pattern.trim().is_empty())
            .find(|pattern| command.contains(pattern.trim()))
            .map(|pattern| format!("Command blocked by settings: {}", pattern.trim()))
    }
}

#[async_trait]
impl ToolPermissionHandler for PermissionGate {
    async fn can_use_tool(&self, request: ToolPermissionRequest) -> PermissionDecision {
        if let Some(message) = self
            .restriction_denial(&request.tool_name)
            .or_else(|| self.blocked_command(&request))
        {
            info!(
                component = "permission",
                event = "permission.denied_by_gate",
                tool = %request.tool_name,
                reason = %message,
            );
            return PermissionDecision::Deny { message };
        }

        match self.handler.request_permission(&request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    component = "permission",
                    event = "permission.handler_failed",
                    tool = %request.tool_name,
                    error = %e,
                    "Permission handler failed; denying"
                );
                PermissionDecision::Deny {
                    message: format!("Permission check failed: {}", e),
                }
            }
        }
    }
}

/// Approves every request. For hosts that run the agent unattended.
pub struct ApproveAll;

#[async_trait]
impl PermissionHandler for ApproveAll {
    async fn request_permission(
        &self,
        _request: &ToolPermissionRequest,
    ) -> Result<PermissionDecision, HandlerError> {
        Ok(PermissionDecision::Allow)
    }
}
