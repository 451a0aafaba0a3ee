//! `polos-runtime` — The in-worker execution engine.
//!
//! Everything between "the orchestrator pushed us work" and "we reported an
//! outcome" lives here:
//!
//! - [`registry`] — process-wide map of workflow id → definition
//! - [`definition`] — workflow / tool / agent definitions and builders
//! - [`store`] + [`step`] — the durable step protocol (memoisation, replay,
//!   suspension, deterministic generators)
//! - [`hooks`] — hook and guardrail middleware
//! - [`memory`] — conversation compaction under a token budget
//! - [`agent`] — the LLM ⇄ tool loop
//! - [`context`] — per-attempt execution state
//! - [`executor`] — runs a handler and classifies the outcome
//!
//! Suspension is cooperative: a step that cannot make progress returns
//! [`Error::Wait`](polos_domain::Error::Wait), the executor reports WAIT,
//! and the task exits. The orchestrator re-dispatches the execution once
//! the dependency resolves; replay then hits the step cache and continues.

pub mod agent;
pub mod context;
pub mod definition;
pub mod executor;
pub mod hooks;
pub mod memory;
pub mod registry;
pub mod step;
pub mod store;

pub use agent::{run_agent, AgentInput, AgentRunInput, AgentRunResult};
pub use context::{ExecutionContext, WorkflowContext};
pub use definition::{
    handler_fn, AgentConfig, ApprovalPolicy, CompactionConfig, DefinitionBuilder, Handler,
    JsonSchema, MaxSteps, Schema, StopCondition, ToolConfig, Trigger, QueueBinding,
    WorkflowDefinition, WorkflowKind,
};
pub use executor::{ExecutionOutcome, Executor};
pub use hooks::{
    compose_hooks, conditional_hook, run_hooks, Guardrail, GuardrailContext, GuardrailOutcome,
    Hook, HookContext, HookPhase, HookResult,
};
pub use memory::{compact_if_needed, is_summary_pair, strip_summary_pair, CompactionOutcome};
pub use registry::{global_registry, Registry};
pub use step::{InvokeHandle, InvokeOptions, ResumeTarget, RunOptions, Step, WaitDuration};
pub use store::{StepResult, StepStore};
