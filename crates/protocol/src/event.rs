//! Agent → core raw events
//!
//! Normalized form of what an agent connection emits. Connectors translate
//! their wire format into these; the core never sees the wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::UsageInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent established or resumed a conversation.
    SessionInit {
        session_id: String,
        model: Option<String>,
    },
    /// Streamed assistant text fragment.
    TextDelta { text: String },
    /// Streamed thinking fragment.
    ThinkingDelta { text: String },
    /// Final (non-streamed) assistant text block.
    AssistantText { text: String },
    /// Final (non-streamed) thinking block.
    AssistantThinking { text: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// The turn finished successfully.
    Result {
        usage: Option<UsageInfo>,
        session_id: Option<String>,
    },
    /// The turn finished with an agent-reported error.
    Error { message: String },
}

impl AgentEvent {
    pub fn is_turn_end(&self) -> bool {
        matches!(self, AgentEvent::Result { .. } | AgentEvent::Error { .. })
    }
}
