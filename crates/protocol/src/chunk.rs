//! Core → caller stream chunks

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::UsageInfo;

/// One item of a streamed response, as seen by the caller.
///
/// Every stream ends with exactly one terminal chunk (`Error` or `Done`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        content: String,
        is_error: bool,
    },
    Usage {
        usage: UsageInfo,
    },
    Error {
        message: String,
    },
    Done,
}

impl StreamChunk {
    pub fn error(message: impl Into<String>) -> Self {
        StreamChunk::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Error { .. } | StreamChunk::Done)
    }

    /// Whether the chunk is conversational content.
    ///
    /// Once any content chunk has reached a caller, a crashed turn can no
    /// longer be replayed silently.
    pub fn is_content(&self) -> bool {
        match self {
            StreamChunk::Text { .. }
            | StreamChunk::Thinking { .. }
            | StreamChunk::ToolUse { .. }
            | StreamChunk::ToolResult { .. } => true,
            StreamChunk::Usage { .. } | StreamChunk::Error { .. } | StreamChunk::Done => false,
        }
    }
}
