//! Streaming events and the normalisation loop that folds them into a
//! complete [`ChatResponse`].

use std::collections::HashMap;
use std::pin::Pin;

use futures_util::StreamExt;
use serde::Serialize;

use polos_domain::error::{Error, Result};
use polos_domain::{ToolCall, Usage};

use crate::traits::ChatResponse;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text chunk.
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with full arguments.
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: String,
    },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// The provider reported an error mid-stream.
    #[serde(rename = "error")]
    StreamError { message: String },
}

/// Receives events as they arrive, before assembly completes.
///
/// The agent loop uses this to publish `text_delta`/`tool_call` events on
/// the execution topic while the provider is still talking.
#[async_trait::async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_event(&self, event: &StreamEvent);
}

/// A sink that ignores everything (non-streaming callers).
pub struct NullSink;

#[async_trait::async_trait]
impl StreamSink for NullSink {
    async fn on_event(&self, _event: &StreamEvent) {}
}

/// Drive a provider stream to completion, forwarding each event to `sink`
/// and assembling the final response.
///
/// Tool calls arriving only as started/delta pairs (some providers never
/// emit a finished marker) are drained at the end in call order.
pub async fn collect_stream(
    mut stream: BoxStream<'static, Result<StreamEvent>>,
    sink: &dyn StreamSink,
    model: &str,
) -> Result<ChatResponse> {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut finish_reason: Option<String> = None;

    // call_id -> (arrival index, name, accumulated args)
    let mut pending: HashMap<String, (usize, String, String)> = HashMap::new();
    let mut arrival: usize = 0;

    while let Some(event) = stream.next().await {
        let event = event?;
        sink.on_event(&event).await;

        match event {
            StreamEvent::TextDelta { text } => content.push_str(&text),
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                pending.insert(call_id, (arrival, tool_name, String::new()));
                arrival += 1;
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, _, args)) = pending.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                pending.remove(&call_id);
                tool_calls.push(ToolCall::new(call_id, tool_name, arguments));
            }
            StreamEvent::Done {
                usage: u,
                finish_reason: fr,
            } => {
                usage = u;
                finish_reason = fr;
            }
            StreamEvent::StreamError { message } => {
                return Err(Error::Http(format!("LLM stream failed: {message}")));
            }
        }
    }

    // Drain calls that came through start/delta but never finished.
    let mut unfinished: Vec<(usize, String, String, String)> = pending
        .drain()
        .map(|(call_id, (idx, name, args))| (idx, call_id, name, args))
        .collect();
    unfinished.sort_by_key(|(idx, ..)| *idx);
    for (_, call_id, name, args) in unfinished {
        tool_calls.push(ToolCall::new(call_id, name, args));
    }

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model: model.to_string(),
        finish_reason,
        raw_output: None,
    })
}
