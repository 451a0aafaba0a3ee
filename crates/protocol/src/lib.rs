//! Worker ⇄ orchestrator wire contract: push-dispatch bodies, registration
//! payloads, event envelopes, session memory, and the suspend form schema.
//!
//! Request bodies use camelCase field names; response bodies use the
//! orchestrator's snake_case keys (`worker_id`, `re_register`). Both sides
//! of the contract live here so the REST client and the worker server can
//! never drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use polos_domain::ConversationMessage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound push endpoint (orchestrator → worker)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /work` — one execution attempt dispatched to this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub execution_id: String,
    pub workflow_id: String,
    pub deployment_id: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub root_execution_id: String,
    pub root_workflow_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_traceparent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// `POST /cancel` — request to abort a running execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelWorkRequest {
    pub execution_id: String,
}

/// Response to both `/work` and `/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accepted {
    pub accepted: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker registration (worker → orchestrator)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capabilities advertised when registering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCapabilities {
    /// Runtime identifier, e.g. `"rust"`.
    pub runtime: String,
    pub agent_ids: Vec<String>,
    pub tool_ids: Vec<String>,
    pub workflow_ids: Vec<String>,
}

/// `POST /workers/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorkerRequest {
    pub deployment_id: String,
    pub project_id: String,
    /// Always `"push"` for this runtime.
    pub mode: String,
    pub capabilities: WorkerCapabilities,
    pub max_concurrent_executions: usize,
    pub push_endpoint_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: String,
}

/// `POST /deployments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeploymentRequest {
    pub deployment_id: String,
}

/// `POST /agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentRequest {
    pub id: String,
    pub deployment_id: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `POST /tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterToolRequest {
    pub id: String,
    pub deployment_id: String,
    pub tool_type: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `POST /deployments/{id}/workflows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWorkflowRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_on_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<bool>,
}

/// One queue binding registered with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
}

/// `POST /queues`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterQueuesRequest {
    pub deployment_id: String,
    pub queues: Vec<QueueEntry>,
}

/// Response to `POST /workers/{id}/heartbeat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// When `true`, the worker must re-run its registration sequence.
    #[serde(default)]
    pub re_register: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution lifecycle reporting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /executions/{id}/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteExecutionRequest {
    pub result: Value,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
}

/// `POST /executions/{id}/fail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailExecutionRequest {
    pub error: String,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
}

/// `POST /executions/{id}/cancel/confirm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmCancellationRequest {
    pub worker_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable step protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /executions/{id}/steps` — record one step outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReportRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// One recorded step, as returned by `GET /executions/{id}/steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub key: String,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListStepsResponse {
    pub steps: Vec<StepRecord>,
}

/// `POST /executions/invoke` — schedule a sub-workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeExecutionRequest {
    pub workflow_id: String,
    pub payload: Value,
    pub parent_execution_id: String,
    pub root_execution_id: String,
    pub root_workflow_id: String,
    pub deployment_id: String,
    /// The step key that issued the invoke, for dedup on the orchestrator.
    pub step_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeExecutionResponse {
    pub execution_id: String,
}

/// Terminal and in-flight execution states as the orchestrator reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// `GET /executions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /executions/{id}/timers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTimerRequest {
    pub step_key: String,
    pub fire_at: DateTime<Utc>,
}

/// `POST /executions/{id}/subscriptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeEventRequest {
    pub topic: String,
    pub step_key: String,
    /// When set, only events of this type satisfy the subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One event in a publish batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub data: Value,
}

/// `POST /events/publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventsRequest {
    pub topic: String,
    pub events: Vec<EventEnvelope>,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_execution_id: Option<String>,
}

/// Event types produced by the core runtime.
pub mod event_types {
    pub const TEXT_DELTA: &str = "text_delta";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const STEP_FINISH: &str = "step_finish";
    pub const WORKFLOW_FINISH: &str = "workflow_finish";
    pub const AGENT_FINISH: &str = "agent_finish";
    pub const WORKFLOW_CANCEL: &str = "workflow_cancel";
}

/// Canonical per-execution stream topic.
pub fn workflow_topic(root_workflow_id: &str, root_execution_id: &str) -> String {
    format!("workflow/{root_workflow_id}/{root_execution_id}")
}

/// Event type announcing a suspension of `step_key`.
pub fn suspend_event_type(step_key: &str) -> String {
    format!("suspend_{step_key}")
}

/// Event type that resumes a suspension of `step_key`.
pub fn resume_event_type(step_key: &str) -> String {
    format!("resume_{step_key}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `GET` / `PUT /sessions/{id}/memory`. Owned by the orchestrator; the
/// worker only round-trips it at agent start/end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMemory {
    pub summary: Option<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Span export
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /internal/spans/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanBatchRequest {
    pub spans: Vec<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Suspend form schema (human-in-the-loop)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Field widget types external channels know how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFieldType {
    Boolean,
    String,
    Number,
    Textarea,
    Select,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FormFieldType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSpec {
    pub title: String,
    pub description: String,
    pub fields: Vec<FormField>,
    #[serde(default)]
    pub context: Value,
}

/// The suspend payload channels render as UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendForm {
    #[serde(rename = "_form")]
    pub form: FormSpec,
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_tool", default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}
