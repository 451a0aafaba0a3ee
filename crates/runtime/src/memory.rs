//! Conversation compaction — collapses old history into a summary pair so
//! the context window stays healthy over long sessions.
//!
//! The summary pair is a user→assistant pair at the head of the
//! conversation, recognisable by a reserved user-message marker. The
//! persistence layer strips it before writing session memory; the loop
//! re-introduces it on load.

use polos_domain::error::Result;
use polos_domain::{ConversationMessage, Role};
use polos_llm::{ChatRequest, LlmProvider};

use crate::definition::CompactionConfig;

/// Reserved content of the summary pair's user message.
pub const SUMMARY_MARKER: &str = "Here is a summary of the conversation so far:";

/// Outcome of a compaction check.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub compacted: bool,
    pub messages: Vec<ConversationMessage>,
    pub summary: Option<String>,
}

/// Whether `messages[offset..offset + 2]` is a summary pair.
///
/// Only the marker shape is inspected; a user-authored message that
/// happens to equal the marker is indistinguishable and will be treated
/// as a summary pair on persist.
pub fn is_summary_pair(messages: &[ConversationMessage], offset: usize) -> bool {
    match (messages.get(offset), messages.get(offset + 1)) {
        (Some(user), Some(assistant)) => {
            user.role == Role::User
                && user.content == SUMMARY_MARKER
                && assistant.role == Role::Assistant
        }
        _ => false,
    }
}

/// Build the head pair carrying `summary`.
pub fn summary_pair(summary: &str) -> [ConversationMessage; 2] {
    [
        ConversationMessage::user(SUMMARY_MARKER),
        ConversationMessage::assistant(summary),
    ]
}

/// Split a leading summary pair off the conversation, returning the
/// carried summary and the remaining messages.
pub fn strip_summary_pair(
    messages: &[ConversationMessage],
) -> (Option<String>, Vec<ConversationMessage>) {
    if is_summary_pair(messages, 0) {
        (Some(messages[1].content.clone()), messages[2..].to_vec())
    } else {
        (None, messages.to_vec())
    }
}

/// Summarise the conversation when its token estimate exceeds the budget.
///
/// Retains the final `min_recent_messages` verbatim, folds everything
/// older (plus any prior summary) into a fresh summary bounded by
/// `max_summary_tokens`, and re-heads the conversation with the summary
/// pair.
pub async fn compact_if_needed(
    messages: &[ConversationMessage],
    summary: Option<&str>,
    cfg: &CompactionConfig,
    provider: &dyn LlmProvider,
) -> Result<CompactionOutcome> {
    let estimate = provider.estimate_tokens(messages);
    if !cfg.enabled || estimate <= cfg.max_conversation_tokens {
        return Ok(CompactionOutcome {
            compacted: false,
            messages: messages.to_vec(),
            summary: summary.map(str::to_owned),
        });
    }

    // Strip an existing summary pair; its text folds into the new prompt.
    let (head_summary, active) = strip_summary_pair(messages);
    let prior_summary = head_summary.or_else(|| summary.map(str::to_owned));

    let keep_from = active.len().saturating_sub(cfg.min_recent_messages);
    let (to_summarise, to_keep) = active.split_at(keep_from);

    if to_summarise.is_empty() {
        return Ok(CompactionOutcome {
            compacted: false,
            messages: messages.to_vec(),
            summary: summary.map(str::to_owned),
        });
    }

    let new_summary =
        generate_summary(provider, to_summarise, prior_summary.as_deref(), cfg).await?;

    let mut compacted = Vec::with_capacity(to_keep.len() + 2);
    compacted.extend(summary_pair(&new_summary));
    compacted.extend_from_slice(to_keep);

    tracing::info!(
        messages_compacted = to_summarise.len(),
        messages_kept = to_keep.len(),
        summary_len = new_summary.len(),
        "conversation compacted"
    );

    Ok(CompactionOutcome {
        compacted: true,
        messages: compacted,
        summary: Some(new_summary),
    })
}

/// Generate the summary using the compaction model (non-streaming).
async fn generate_summary(
    provider: &dyn LlmProvider,
    messages: &[ConversationMessage],
    prior_summary: Option<&str>,
    cfg: &CompactionConfig,
) -> Result<String> {
    let conversation = build_conversation_text(messages);
    let prior = prior_summary
        .map(|s| format!("PREVIOUS SUMMARY:\n{s}\n\n"))
        .unwrap_or_default();

    let prompt = format!(
        "You are a conversation summarizer. Summarize the following conversation \
         history into a concise summary that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\
         5. Tool state (running processes, pending work)\n\n\
         Be concise but preserve all actionable context. Write in present tense.\n\
         Omit greetings and pleasantries. Focus on substance.\n\n\
         {prior}CONVERSATION:\n{conversation}"
    );

    let req = ChatRequest {
        messages: vec![ConversationMessage::user(prompt)],
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(cfg.max_summary_tokens.min(u32::MAX as u64) as u32),
        response_schema: None,
        model: cfg.model.clone(),
    };

    let resp = provider.generate(req).await?;
    Ok(resp.content)
}

fn build_conversation_text(messages: &[ConversationMessage]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let role_label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        buf.push_str(role_label);
        buf.push_str(": ");
        // Truncate very long entries (tool results) to keep the summary
        // prompt manageable.
        if msg.content.len() > 2000 {
            buf.push_str(&msg.content[..1000]);
            buf.push_str(" [...] ");
            buf.push_str(&msg.content[msg.content.len() - 500..]);
        } else {
            buf.push_str(&msg.content);
        }
        buf.push('\n');
    }
    buf
}
