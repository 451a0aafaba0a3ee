//! `polos-domain` — Shared types for the Polos worker runtime.
//!
//! Everything the other crates agree on lives here: the error enum, the
//! conversation/tool-call model, the tagged value codec used by the step
//! cache, and the worker configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod trace;

pub use codec::StepValue;
pub use config::WorkerConfig;
pub use error::{Error, Result, WaitPending, WaitReason};
pub use message::{
    ConversationMessage, Role, StepInfo, ToolCall, ToolCallFunction, ToolResultInfo,
    ToolResultStatus, Usage,
};
