//! `polos-llm` — Provider-agnostic LLM adapter.
//!
//! Concrete provider SDKs live outside this workspace; user code hands the
//! runtime an implementation of [`LlmProvider`]. This crate owns the shapes
//! both sides agree on (chat request/response, stream events) and the
//! normalisation glue: assembling streamed tool-call fragments into whole
//! [`ToolCall`](polos_domain::ToolCall)s and accumulating token usage.

pub mod stream;
pub mod traits;

pub use stream::{collect_stream, BoxStream, NullSink, StreamEvent, StreamSink};
pub use traits::{ChatRequest, ChatResponse, LlmProvider, ToolSpec};
