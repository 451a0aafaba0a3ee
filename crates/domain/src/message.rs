//! Conversation model shared by the agent loop, the LLM adapter, and the
//! orchestrator's session-memory store.

use serde::{Deserialize, Serialize};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a conversation.
///
/// `tool_calls` is set on assistant messages that requested tools;
/// `tool_call_id` on tool messages carrying a result back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// An assistant message that requested tool calls.
    pub fn assistant_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// A tool message carrying the result of one call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is the raw JSON string exactly as the model produced it —
/// consumers parse it and fall back to `{}` on malformed payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub call_id: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let call_id = call_id.into();
        Self {
            id: call_id.clone(),
            call_id,
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the argument JSON, defaulting to an empty object when the
    /// model produced something unparseable.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        if self.function.arguments.trim().is_empty() {
            return serde_json::Value::Object(Default::default());
        }
        match serde_json::from_str(&self.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    call_id = %self.call_id,
                    tool = %self.function.name,
                    error = %e,
                    "tool call arguments are not valid JSON; defaulting to empty object"
                );
                serde_json::Value::Object(Default::default())
            }
        }
    }
}

/// Token usage for one or more LLM calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl Usage {
    /// Accumulate another usage record. Counters only grow; cache fields
    /// are summed when present on either side.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        if other.cache_read_input_tokens.is_some() || self.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = Some(
                self.cache_read_input_tokens.unwrap_or(0)
                    + other.cache_read_input_tokens.unwrap_or(0),
            );
        }
        if other.cache_creation_input_tokens.is_some()
            || self.cache_creation_input_tokens.is_some()
        {
            self.cache_creation_input_tokens = Some(
                self.cache_creation_input_tokens.unwrap_or(0)
                    + other.cache_creation_input_tokens.unwrap_or(0),
            );
        }
    }
}

/// Outcome status of one tool execution inside an agent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Completed,
    Failed,
}

/// One tool execution result, recorded in the agent's step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultInfo {
    pub id: String,
    pub name: String,
    pub status: ToolResultStatus,
    pub result: serde_json::Value,
}

/// One LLM round in the agent loop, appended to the steps array that stop
/// conditions evaluate over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: u32,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResultInfo>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_carries_call_id() {
        let msg = ConversationMessage::tool_result("call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn malformed_arguments_default_to_empty_object() {
        let tc = ToolCall::new("c1", "echo", "{not json");
        assert_eq!(tc.parsed_arguments(), serde_json::json!({}));
        let tc = ToolCall::new("c2", "echo", "");
        assert_eq!(tc.parsed_arguments(), serde_json::json!({}));
        let tc = ToolCall::new("c3", "echo", r#"{"v":"hi"}"#);
        assert_eq!(tc.parsed_arguments(), serde_json::json!({"v": "hi"}));
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            cache_read_input_tokens: Some(3),
            cache_creation_input_tokens: None,
        });
        total.add(&Usage {
            input_tokens: 7,
            output_tokens: 2,
            total_tokens: 9,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: Some(4),
        });
        assert_eq!(total.input_tokens, 17);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.total_tokens, 24);
        assert_eq!(total.cache_read_input_tokens, Some(3));
        assert_eq!(total.cache_creation_input_tokens, Some(4));
    }

    #[test]
    fn role_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
