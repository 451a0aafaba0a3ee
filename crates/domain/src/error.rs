//! Shared error type used across all Polos crates.
//!
//! Suspension is modelled as an error *variant*, not a panic or a distinct
//! type: [`Error::Wait`] carries the pending dependency and is recognised
//! across crate boundaries via [`Error::is_wait`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a suspended execution is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitReason {
    /// One or more sub-executions must complete.
    SubExecutions { execution_ids: Vec<String> },
    /// A timer registered with the orchestrator must fire.
    Timer { fire_at: DateTime<Utc> },
    /// An event must be published on a topic.
    Event {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_at: Option<DateTime<Utc>>,
    },
}

/// The dependency carried by a suspension signal.
///
/// The executor reports WAIT and releases the task; the orchestrator
/// re-dispatches the execution once the dependency resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitPending {
    /// The step key that suspended.
    pub step_key: String,
    pub reason: WaitReason,
}

impl std::fmt::Display for WaitPending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            WaitReason::SubExecutions { execution_ids } => {
                write!(f, "step '{}' waiting on {:?}", self.step_key, execution_ids)
            }
            WaitReason::Timer { fire_at } => {
                write!(f, "step '{}' waiting until {fire_at}", self.step_key)
            }
            WaitReason::Event { topic, .. } => {
                write!(f, "step '{}' waiting for event on '{topic}'", self.step_key)
            }
        }
    }
}

/// Shared error type used across all Polos crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("orchestrator API ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflow(String),

    #[error("step key '{0}' was already used in this execution")]
    DuplicateStepKey(String),

    #[error("step '{key}' failed after retries: {message}")]
    StepExecution { key: String, message: String },

    /// Not a failure — the suspension signal of the durable step protocol.
    #[error("waiting: {0}")]
    Wait(WaitPending),

    #[error("timed out waiting for event on '{topic}'")]
    EventTimeout { topic: String },

    #[error("guardrail failed: {0}")]
    GuardrailFailure(String),

    #[error("hook '{hook}' failed: {message}")]
    HookFailure { hook: String, message: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this value is the suspension signal rather than a failure.
    pub fn is_wait(&self) -> bool {
        matches!(self, Error::Wait(_))
    }

    /// Whether a workflow attempt that died with this error may be retried
    /// by the orchestrator. Exhausted step retries are terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::StepExecution { .. }
                | Error::DuplicateStepKey(_)
                | Error::DuplicateWorkflow(_)
                | Error::Validation(_)
        )
    }

    /// Shorthand for a terminal step failure.
    pub fn step_execution(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::StepExecution {
            key: key.into(),
            message: message.into(),
        }
    }
}
