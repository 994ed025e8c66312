//! Raw agent events → caller-facing chunks
//!
//! Pure translation shared by the persistent router and the cold-start
//! path. Per-turn flags decide whether a final assistant block repeats
//! text that already streamed.

use vaultpilot_protocol::{AgentEvent, StreamChunk, UsageInfo};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnFlags {
    /// A content chunk reached the caller this turn.
    pub saw_any_chunk: bool,
    pub saw_stream_text: bool,
    pub saw_stream_thinking: bool,
}

impl TurnFlags {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Session established or resumed; not forwarded.
    Session {
        session_id: String,
        model: Option<String>,
    },
    Chunk(StreamChunk),
    /// Duplicate or empty; dropped.
    Suppressed,
    TurnComplete {
        usage: Option<UsageInfo>,
        session_id: Option<String>,
    },
    TurnFailed {
        message: String,
    },
}

pub fn transform(event: AgentEvent, flags: &mut TurnFlags) -> Transformed {
    let transformed = match event {
        AgentEvent::SessionInit { session_id, model } => {
            return Transformed::Session { session_id, model };
        }
        AgentEvent::TextDelta { text } => {
            if text.is_empty() {
                return Transformed::Suppressed;
            }
            flags.saw_stream_text = true;
            Transformed::Chunk(StreamChunk::Text { content: text })
        }
        AgentEvent::ThinkingDelta { text } => {
            if text.is_empty() {
                return Transformed::Suppressed;
            }
            flags.saw_stream_thinking = true;
            Transformed::Chunk(StreamChunk::Thinking { content: text })
        }
        AgentEvent::AssistantText { text } => {
            if flags.saw_stream_text || text.is_empty() {
                return Transformed::Suppressed;
            }
            Transformed::Chunk(StreamChunk::Text { content: text })
        }
        AgentEvent::AssistantThinking { text } => {
            if flags.saw_stream_thinking || text.is_empty() {
                return Transformed::Suppressed;
            }
            Transformed::Chunk(StreamChunk::Thinking { content: text })
        }
        AgentEvent::ToolUse { id, name, input } => {
            Transformed::Chunk(StreamChunk::ToolUse { id, name, input })
        }
        AgentEvent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Transformed::Chunk(StreamChunk::ToolResult {
            id: tool_use_id,
            content,
            is_error,
        }),
        AgentEvent::Result { usage, session_id } => {
            flags.reset();
            return Transformed::TurnComplete { usage, session_id };
        }
        AgentEvent::Error { message } => {
            flags.reset();
            return Transformed::TurnFailed { message };
        }
    };

    if let Transformed::Chunk(chunk) = &transformed {
        if chunk.is_content() {
            flags.saw_any_chunk = true;
        }
    }
    transformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn streamed_text_suppresses_final_block() {
        let mut flags = TurnFlags::default();
        let delta = transform(AgentEvent::TextDelta { text: "Hel".into() }, &mut flags);
        assert_eq!(
            delta,
            Transformed::Chunk(StreamChunk::Text {
                content: "Hel".into()
            })
        );
        let final_block = transform(
            AgentEvent::AssistantText {
                text: "Hello".into(),
            },
            &mut flags,
        );
        assert_eq!(final_block, Transformed::Suppressed);
    }

    #[test]
    fn final_block_passes_without_streaming() {
        let mut flags = TurnFlags::default();
        let out = transform(
            AgentEvent::AssistantText {
                text: "Hello".into(),
            },
            &mut flags,
        );
        assert!(matches!(out, Transformed::Chunk(StreamChunk::Text { .. })));
        assert!(flags.saw_any_chunk);
    }

    #[test]
    fn turn_end_resets_dedup_flags() {
        let mut flags = TurnFlags::default();
        transform(AgentEvent::TextDelta { text: "a".into() }, &mut flags);
        let done = transform(
            AgentEvent::Result {
                usage: None,
                session_id: None,
            },
            &mut flags,
        );
        assert!(matches!(done, Transformed::TurnComplete { .. }));
        assert_eq!(flags, TurnFlags::default());

        let next = transform(AgentEvent::AssistantText { text: "b".into() }, &mut flags);
        assert!(matches!(next, Transformed::Chunk(_)));
    }

    #[test]
    fn tool_use_counts_as_a_chunk() {
        let mut flags = TurnFlags::default();
        transform(
            AgentEvent::ToolUse {
                id: "t1".into(),
                name: "Read".into(),
                input: json!({"file_path": "note.md"}),
            },
            &mut flags,
        );
        assert!(flags.saw_any_chunk);
    }

    #[test]
    fn session_events_are_not_chunks() {
        let mut flags = TurnFlags::default();
        let out = transform(
            AgentEvent::SessionInit {
                session_id: "s1".into(),
                model: Some("sonnet".into()),
            },
            &mut flags,
        );
        assert!(matches!(out, Transformed::Session { .. }));
        assert!(!flags.saw_any_chunk);
    }
}
