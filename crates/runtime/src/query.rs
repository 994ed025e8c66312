//! Caller-facing request types

use std::path::PathBuf;

use vaultpilot_protocol::{HistoryTurn, ImageAttachment};

/// Per-call options for a streamed query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Restrict the turn to these tools. `None` means no restriction.
    pub allowed_tools: Option<Vec<String>>,
    /// Model override for this call.
    pub model: Option<String>,
    /// MCP servers explicitly requested for this call (in addition to enabled ones).
    pub mcp_servers: Vec<String>,
    /// Bypass the persistent connection and run on a disposable one.
    pub force_cold_start: bool,
    /// Extra directories the agent gets full access to.
    pub external_context_paths: Vec<PathBuf>,
}

/// One streamed query.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
    /// Prior turns from the local transcript, used only to rebuild lost context.
    pub history: Vec<HistoryTurn>,
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }
}
