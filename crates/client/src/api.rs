//! The orchestrator contract as a trait.
//!
//! One method per endpoint, typed with the `polos-protocol` bodies. The
//! transport is shared across executions and must be safe for concurrent
//! requests.

use async_trait::async_trait;

use polos_domain::error::Result;
use polos_protocol::{
    CompleteExecutionRequest, ConfirmCancellationRequest, ExecutionStatusResponse,
    FailExecutionRequest, HeartbeatResponse, InvokeExecutionRequest, InvokeExecutionResponse,
    ListStepsResponse, PublishEventsRequest, RegisterAgentRequest, RegisterDeploymentRequest,
    RegisterQueuesRequest, RegisterTimerRequest, RegisterToolRequest, RegisterWorkerRequest,
    RegisterWorkerResponse, RegisterWorkflowRequest, SessionMemory, SpanBatchRequest,
    StepReportRequest, SubscribeEventRequest,
};

#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    // ── Worker lifecycle ─────────────────────────────────────────────

    async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse>;

    async fn register_deployment(&self, req: RegisterDeploymentRequest) -> Result<()>;

    async fn register_agent(&self, req: RegisterAgentRequest) -> Result<()>;

    async fn register_tool(&self, req: RegisterToolRequest) -> Result<()>;

    async fn register_workflow(
        &self,
        deployment_id: &str,
        req: RegisterWorkflowRequest,
    ) -> Result<()>;

    async fn register_queues(&self, req: RegisterQueuesRequest) -> Result<()>;

    async fn heartbeat(&self, worker_id: &str) -> Result<HeartbeatResponse>;

    async fn mark_online(&self, worker_id: &str) -> Result<()>;

    // ── Execution reporting ──────────────────────────────────────────
    //
    // A 409 from any of these means the execution was reassigned; the
    // implementation discards it silently and returns Ok.

    async fn complete_execution(
        &self,
        execution_id: &str,
        req: CompleteExecutionRequest,
    ) -> Result<()>;

    async fn fail_execution(&self, execution_id: &str, req: FailExecutionRequest) -> Result<()>;

    async fn confirm_cancellation(
        &self,
        execution_id: &str,
        req: ConfirmCancellationRequest,
    ) -> Result<()>;

    // ── Durable step protocol ────────────────────────────────────────

    async fn report_step(&self, execution_id: &str, req: StepReportRequest) -> Result<()>;

    async fn list_steps(&self, execution_id: &str) -> Result<ListStepsResponse>;

    async fn invoke_execution(&self, req: InvokeExecutionRequest)
        -> Result<InvokeExecutionResponse>;

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionStatusResponse>;

    async fn cancel_execution(&self, execution_id: &str) -> Result<()>;

    async fn register_timer(&self, execution_id: &str, req: RegisterTimerRequest) -> Result<()>;

    async fn subscribe_event(&self, execution_id: &str, req: SubscribeEventRequest) -> Result<()>;

    // ── Events & session memory ──────────────────────────────────────

    async fn publish_events(&self, req: PublishEventsRequest) -> Result<()>;

    async fn get_session_memory(&self, session_id: &str) -> Result<SessionMemory>;

    async fn put_session_memory(&self, session_id: &str, memory: &SessionMemory) -> Result<()>;

    // ── Span export ──────────────────────────────────────────────────

    async fn export_spans(&self, req: SpanBatchRequest) -> Result<()>;
}
