//! Agent connection traits
//!
//! A launcher turns a `LaunchConfig` plus an input stream into a running
//! connection and a stream of raw events. The connection handle carries
//! the live controls (model, thinking budget, permission mode, MCP set)
//! and the two ways of stopping a turn: graceful interrupt and hard abort.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vaultpilot_protocol::{
    AgentEvent, McpServerConfig, OutboundMessage, PermissionMode, SlashCommandInfo,
};

use crate::permission::ToolPermissionHandler;
use crate::ConnectorError;

/// User messages flowing into a connection. Ends when the feeding channel closes.
pub type InputStream = BoxStream<'static, OutboundMessage>;

/// Raw events flowing out of a connection. An `Err` is a transport
/// failure; the stream ends right after it.
pub type EventStream = mpsc::Receiver<Result<AgentEvent, ConnectorError>>;

/// Everything needed to start one agent connection.
#[derive(Clone)]
pub struct LaunchConfig {
    pub cwd: PathBuf,
    pub executable: PathBuf,
    pub env: Vec<(String, String)>,
    pub model: Option<String>,
    pub max_thinking_tokens: Option<u64>,
    pub permission_mode: PermissionMode,
    pub resume_session_id: Option<String>,
    pub system_prompt: Option<String>,
    pub disallowed_tools: Vec<String>,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub plugin_dirs: Vec<PathBuf>,
    pub additional_directories: Vec<PathBuf>,
    pub setting_sources: Vec<String>,
    pub permission_handler: Arc<dyn ToolPermissionHandler>,
    /// Hard abort signal; cancelling it must tear the connection down.
    pub abort: CancellationToken,
}

impl std::fmt::Debug for LaunchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchConfig")
            .field("cwd", &self.cwd)
            .field("executable", &self.executable)
            .field("model", &self.model)
            .field("max_thinking_tokens", &self.max_thinking_tokens)
            .field("permission_mode", &self.permission_mode)
            .field("resume_session_id", &self.resume_session_id)
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A started connection: its control handle and its event stream.
pub struct LaunchedAgent {
    pub connection: Arc<dyn AgentConnection>,
    pub events: EventStream,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(
        &self,
        config: LaunchConfig,
        input: InputStream,
    ) -> Result<LaunchedAgent, ConnectorError>;
}

#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn set_model(&self, model: Option<&str>) -> Result<(), ConnectorError>;

    async fn set_max_thinking_tokens(&self, tokens: Option<u64>) -> Result<(), ConnectorError>;

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), ConnectorError>;

    async fn set_mcp_servers(
        &self,
        servers: &BTreeMap<String, McpServerConfig>,
    ) -> Result<(), ConnectorError>;

    /// Ask the agent to stop the current turn. The connection stays usable.
    async fn interrupt(&self) -> Result<(), ConnectorError>;

    /// Tear the connection down immediately.
    fn abort(&self);

    async fn supported_commands(&self) -> Result<Vec<SlashCommandInfo>, ConnectorError>;
}
