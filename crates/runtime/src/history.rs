//! Prompt reconstruction from the local transcript
//!
//! Used when the remote side has no memory of the conversation: the prior
//! turns are rendered as text and prefixed to the next prompt.

use vaultpilot_protocol::{HistoryTurn, Role};

/// Render prior turns as a tagged transcript block. Empty when there is
/// nothing worth sending.
pub fn build_context_from_history(history: &[HistoryTurn]) -> String {
    let mut sections = Vec::new();
    for turn in history {
        let text = turn.text.trim();
        if text.is_empty() && turn.images.is_empty() {
            continue;
        }
        let speaker = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let mut section = format!("{}: {}", speaker, text);
        match turn.images.len() {
            0 => {}
            1 => section.push_str("\n[1 image attached]"),
            n => section.push_str(&format!("\n[{} images attached]", n)),
        }
        sections.push(section);
    }

    if sections.is_empty() {
        return String::new();
    }
    format!(
        "<conversation_history>\n{}\n</conversation_history>",
        sections.join("\n\n")
    )
}

/// Prefix `prompt` with the rebuilt conversation. A trailing user turn
/// identical to `prompt` is the current request itself and is skipped.
pub fn build_prompt_with_history(history: &[HistoryTurn], prompt: &str) -> String {
    let prior = match history.split_last() {
        Some((last, rest)) if last.role == Role::User && last.text.trim() == prompt.trim() => rest,
        _ => history,
    };

    let context = build_context_from_history(prior);
    if context.is_empty() {
        return prompt.to_string();
    }
    format!(
        "{}\n\nThe conversation above was restored from a saved transcript. Continue it.\n\n{}",
        context, prompt
    )
}
