use polos_domain::error::Result;
use polos_domain::{ConversationMessage, ToolCall, Usage};

use crate::stream::{BoxStream, StreamEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool definition exposed to the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<ConversationMessage>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolSpec>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// JSON Schema the response must conform to. Only set when no tools
    /// are enabled — providers reject tool-use combined with a response
    /// format.
    pub response_schema: Option<serde_json::Value>,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Tool calls emitted by the model, normalised.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, when the provider reports it.
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// Why the model stopped (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
    /// Raw provider payload, for the agent step log.
    pub raw_output: Option<serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter must implement.
///
/// Implementations translate between these types and a concrete provider's
/// wire format. They are shared across executions and must be safe for
/// concurrent requests.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat request and wait for the full response.
    async fn generate(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Send a chat request and return a stream of events.
    async fn stream(&self, req: ChatRequest)
        -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// The default model identifier for this provider instance.
    fn model(&self) -> &str;

    /// Estimate the token footprint of a message list.
    ///
    /// Used by the memory compactor to decide when to summarise. The
    /// default is the usual chars/4 heuristic; providers with real
    /// tokenizers should override it.
    fn estimate_tokens(&self, messages: &[ConversationMessage]) -> u64 {
        messages
            .iter()
            .map(|m| (m.content.len() as u64) / 4 + 4)
            .sum()
    }
}
