//! Per-attempt execution state.
//!
//! An [`ExecutionContext`] lives for exactly one attempt at one execution.
//! It carries identity, cancellation, and trace linkage; the step cache
//! hangs off [`WorkflowContext`] together with the helper handle passed to
//! handlers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use polos_protocol::WorkRequest;

use crate::registry::Registry;
use crate::step::Step;

/// Identity and ambient state of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub root_execution_id: String,
    pub parent_execution_id: Option<String>,
    pub workflow_id: String,
    pub root_workflow_id: String,
    pub deployment_id: String,
    pub retry_count: u32,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub initial_state: Option<Value>,
    pub run_timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Fires on orchestrator cancel, per-execution timeout, or worker
    /// shutdown. Cooperative — handlers observe it at suspension points.
    pub cancel: CancellationToken,
    /// Inbound W3C traceparent, when this is a child execution.
    pub otel_traceparent: Option<String>,
    /// Parent span id the orchestrator attached to the dispatch.
    pub otel_span_id: Option<String>,
}

impl ExecutionContext {
    /// Build the context for one inbound dispatch.
    pub fn from_work_request(req: &WorkRequest, cancel: CancellationToken) -> Self {
        Self {
            execution_id: req.execution_id.clone(),
            root_execution_id: req.root_execution_id.clone(),
            parent_execution_id: req.parent_execution_id.clone(),
            workflow_id: req.workflow_id.clone(),
            root_workflow_id: req.root_workflow_id.clone(),
            deployment_id: req.deployment_id.clone(),
            retry_count: req.retry_count,
            session_id: req.session_id.clone(),
            user_id: req.user_id.clone(),
            initial_state: req.initial_state.clone(),
            run_timeout_seconds: req.run_timeout_seconds,
            created_at: req.created_at,
            cancel,
            otel_traceparent: req.otel_traceparent.clone(),
            otel_span_id: req.otel_span_id.clone(),
        }
    }

    /// Trace identity for this attempt's spans.
    ///
    /// Children inherit `(trace_id, parent_span_id)` from the inbound
    /// traceparent (the explicit dispatch span id wins as the parent);
    /// roots derive their trace id from the execution UUID.
    pub fn trace_identity(&self) -> (Option<String>, Option<String>) {
        if let Some((trace_id, span_id)) = self
            .otel_traceparent
            .as_deref()
            .and_then(polos_domain::trace::parse_traceparent)
        {
            let parent = self.otel_span_id.clone().unwrap_or(span_id);
            return (Some(trace_id), Some(parent));
        }
        (
            polos_domain::trace::trace_id_from_execution(&self.root_execution_id),
            self.otel_span_id.clone(),
        )
    }

    /// The canonical event topic for this execution's stream.
    pub fn topic(&self) -> String {
        polos_protocol::workflow_topic(&self.root_workflow_id, &self.root_execution_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Everything a workflow handler receives: identity, the step helper, the
/// workflow registry (agents resolve tools through it), and the mutable
/// final-state slot reported back to the orchestrator on completion.
pub struct WorkflowContext {
    pub execution: ExecutionContext,
    pub step: Step,
    pub registry: std::sync::Arc<Registry>,
    state: Mutex<Option<Value>>,
}

impl WorkflowContext {
    pub fn new(
        execution: ExecutionContext,
        step: Step,
        registry: std::sync::Arc<Registry>,
    ) -> Self {
        let state = Mutex::new(execution.initial_state.clone());
        Self {
            execution,
            step,
            registry,
            state,
        }
    }

    /// Replace the workflow state reported as `finalState` on completion.
    pub fn set_state(&self, value: Value) {
        *self.state.lock() = Some(value);
    }

    /// Current workflow state, if any.
    pub fn state(&self) -> Option<Value> {
        self.state.lock().clone()
    }
}
