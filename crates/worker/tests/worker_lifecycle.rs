//! Worker lifecycle tests: the state machine, the registration sequence,
//! dispatch admission control, cancellation, timeouts, heartbeat-driven
//! re-registration, and shutdown draining.
//!
//! Each test binds its own fixed port so the suite can run concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use polos_client::OrchestratorApi;
use polos_domain::config::WorkerConfig;
use polos_domain::error::{Error, Result};
use polos_domain::ConversationMessage;
use polos_llm::{BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent};
use polos_protocol::*;
use polos_runtime::{handler_fn, AgentConfig, Registry, Trigger, WorkflowDefinition};
use polos_worker::{InboundHandler, Worker, WorkerState};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observer orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct ObserverOrchestrator {
    register_worker_calls: Mutex<Vec<RegisterWorkerRequest>>,
    deployments: Mutex<Vec<String>>,
    agents: Mutex<Vec<RegisterAgentRequest>>,
    tools: Mutex<Vec<RegisterToolRequest>>,
    workflows: Mutex<Vec<RegisterWorkflowRequest>>,
    queues: Mutex<Vec<RegisterQueuesRequest>>,
    online: Mutex<u32>,
    heartbeats: Mutex<u32>,
    /// Heartbeat numbers (1-based) that answer `re_register = true`.
    re_register_on: Mutex<Vec<u32>>,
    completions: Mutex<Vec<(String, CompleteExecutionRequest)>>,
    failures: Mutex<Vec<(String, FailExecutionRequest)>>,
    cancel_confirms: Mutex<Vec<String>>,
}

impl ObserverOrchestrator {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OrchestratorApi for ObserverOrchestrator {
    async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        self.register_worker_calls.lock().push(req);
        Ok(RegisterWorkerResponse {
            worker_id: "wrk_observed".into(),
        })
    }

    async fn register_deployment(&self, req: RegisterDeploymentRequest) -> Result<()> {
        self.deployments.lock().push(req.deployment_id);
        Ok(())
    }

    async fn register_agent(&self, req: RegisterAgentRequest) -> Result<()> {
        self.agents.lock().push(req);
        Ok(())
    }

    async fn register_tool(&self, req: RegisterToolRequest) -> Result<()> {
        self.tools.lock().push(req);
        Ok(())
    }

    async fn register_workflow(&self, _d: &str, req: RegisterWorkflowRequest) -> Result<()> {
        self.workflows.lock().push(req);
        Ok(())
    }

    async fn register_queues(&self, req: RegisterQueuesRequest) -> Result<()> {
        self.queues.lock().push(req);
        Ok(())
    }

    async fn heartbeat(&self, _worker_id: &str) -> Result<HeartbeatResponse> {
        let mut beats = self.heartbeats.lock();
        *beats += 1;
        let re_register = self.re_register_on.lock().contains(&*beats);
        Ok(HeartbeatResponse { re_register })
    }

    async fn mark_online(&self, _worker_id: &str) -> Result<()> {
        *self.online.lock() += 1;
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        req: CompleteExecutionRequest,
    ) -> Result<()> {
        self.completions
            .lock()
            .push((execution_id.to_owned(), req));
        Ok(())
    }

    async fn fail_execution(&self, execution_id: &str, req: FailExecutionRequest) -> Result<()> {
        self.failures.lock().push((execution_id.to_owned(), req));
        Ok(())
    }

    async fn confirm_cancellation(
        &self,
        execution_id: &str,
        _req: ConfirmCancellationRequest,
    ) -> Result<()> {
        self.cancel_confirms.lock().push(execution_id.to_owned());
        Ok(())
    }

    async fn report_step(&self, _e: &str, _req: StepReportRequest) -> Result<()> {
        Ok(())
    }

    async fn list_steps(&self, _e: &str) -> Result<ListStepsResponse> {
        Ok(ListStepsResponse::default())
    }

    async fn invoke_execution(
        &self,
        _req: InvokeExecutionRequest,
    ) -> Result<InvokeExecutionResponse> {
        Err(Error::Other("not supported in this test".into()))
    }

    async fn get_execution(&self, _e: &str) -> Result<ExecutionStatusResponse> {
        Err(Error::Other("not supported in this test".into()))
    }

    async fn cancel_execution(&self, _e: &str) -> Result<()> {
        Ok(())
    }

    async fn register_timer(&self, _e: &str, _req: RegisterTimerRequest) -> Result<()> {
        Ok(())
    }

    async fn subscribe_event(&self, _e: &str, _req: SubscribeEventRequest) -> Result<()> {
        Ok(())
    }

    async fn publish_events(&self, _req: PublishEventsRequest) -> Result<()> {
        Ok(())
    }

    async fn get_session_memory(&self, _s: &str) -> Result<SessionMemory> {
        Ok(SessionMemory::default())
    }

    async fn put_session_memory(&self, _s: &str, _m: &SessionMemory) -> Result<()> {
        Ok(())
    }

    async fn export_spans(&self, _req: SpanBatchRequest) -> Result<()> {
        Ok(())
    }
}

// ── Static LLM stub (registration metadata only) ────────────────────────

struct StaticLlm;

#[async_trait]
impl LlmProvider for StaticLlm {
    async fn generate(&self, _req: ChatRequest) -> Result<ChatResponse> {
        Err(Error::Other("not used".into()))
    }

    async fn stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        Err(Error::Other("not used".into()))
    }

    fn model(&self) -> &str {
        "static-model-1"
    }

    fn estimate_tokens(&self, _messages: &[ConversationMessage]) -> u64 {
        0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_config(port: u16) -> WorkerConfig {
    let mut cfg = WorkerConfig::default();
    cfg.server.port = port;
    cfg.server.local_mode = true;
    cfg.otel.enabled = false;
    cfg.deployment_id = "dep-test".into();
    cfg
}

fn work(execution_id: &str, workflow_id: &str) -> WorkRequest {
    WorkRequest {
        execution_id: execution_id.into(),
        workflow_id: workflow_id.into(),
        deployment_id: "dep-test".into(),
        payload: json!({"n": 21}),
        parent_execution_id: None,
        root_execution_id: execution_id.into(),
        root_workflow_id: workflow_id.into(),
        retry_count: 0,
        session_id: None,
        user_id: None,
        otel_traceparent: None,
        otel_span_id: None,
        initial_state: None,
        run_timeout_seconds: None,
        created_at: chrono::Utc::now(),
    }
}

/// Workflow whose handler parks until its abort token fires.
fn cancellable_workflow(id: &str) -> Arc<WorkflowDefinition> {
    WorkflowDefinition::workflow(id)
        .handler(handler_fn(|ctx, _payload| async move {
            loop {
                if ctx.execution.is_cancelled() {
                    return Err::<Value, _>(Error::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }))
        .build()
        .unwrap()
}

async fn wait_until(mut probe: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    probe()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn state_machine_rejects_illegal_transitions() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let worker = Worker::with_client(test_config(38011), registry, mock.clone());

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(worker.shutdown().await.is_err()); // stopped → stopping is illegal

    worker.start().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    assert!(worker.start().await.is_err()); // running → starting is illegal

    worker.shutdown().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(worker.shutdown().await.is_err());
}

#[tokio::test]
async fn registration_sequence_covers_all_definition_kinds() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());

    registry
        .register(
            WorkflowDefinition::workflow("ingest")
                .queue("default", Some(5))
                .handler(handler_fn(|_c, p| async move { Ok(p) }))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            WorkflowDefinition::workflow("transform")
                .queue("default", Some(2))
                .handler(handler_fn(|_c, p| async move { Ok(p) }))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            WorkflowDefinition::workflow("nightly")
                .trigger(Trigger::Cron("0 3 * * *".into()))
                .queue("cron-lane", Some(1))
                .handler(handler_fn(|_c, p| async move { Ok(p) }))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            WorkflowDefinition::tool("echo", "Echo the input", json!({"type": "object"}))
                .handler(handler_fn(|_c, p| async move { Ok(p) }))
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut agent_cfg = AgentConfig::new(Arc::new(StaticLlm), "You are helpful.");
    agent_cfg.provider = "scripted".into();
    agent_cfg.tools = vec!["echo".into()];
    agent_cfg.temperature = Some(0.2);
    registry
        .register(WorkflowDefinition::agent("assistant", agent_cfg).build().unwrap())
        .unwrap();

    let worker = Worker::with_client(test_config(38012), registry, mock.clone());
    worker.start().await.unwrap();

    // Worker registration advertised every definition, sorted.
    let reg = mock.register_worker_calls.lock()[0].clone();
    assert_eq!(reg.mode, "push");
    assert_eq!(reg.capabilities.runtime, "rust");
    assert_eq!(reg.capabilities.agent_ids, vec!["assistant"]);
    assert_eq!(reg.capabilities.tool_ids, vec!["echo"]);
    assert_eq!(
        reg.capabilities.workflow_ids,
        vec!["ingest", "nightly", "transform"]
    );
    assert_eq!(worker.worker_id().as_deref(), Some("wrk_observed"));

    assert_eq!(mock.deployments.lock().as_slice(), ["dep-test"]);

    // Agent metadata came from its definition.
    let agents = mock.agents.lock();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].model, "static-model-1");
    assert_eq!(agents[0].provider, "scripted");
    assert_eq!(agents[0].tools.as_deref(), Some(&["echo".to_owned()][..]));

    assert_eq!(mock.tools.lock().len(), 1);
    assert_eq!(mock.workflows.lock().len(), 5);
    let scheduled: Vec<_> = mock
        .workflows
        .lock()
        .iter()
        .filter(|w| w.scheduled == Some(true))
        .map(|w| w.workflow_id.clone())
        .collect();
    assert_eq!(scheduled, vec!["nightly"]);

    // Queue collection: min(limit) per queue, scheduled workflows omitted.
    let queues = mock.queues.lock()[0].clone();
    assert_eq!(queues.queues.len(), 1);
    assert_eq!(queues.queues[0].name, "default");
    assert_eq!(queues.queues[0].concurrency_limit, Some(2));

    assert_eq!(*mock.online.lock(), 1);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn dispatch_executes_and_reports_completion() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());
    registry
        .register(
            WorkflowDefinition::workflow("double")
                .handler(handler_fn(|_ctx, payload| async move {
                    let n = payload["n"].as_i64().unwrap_or(0);
                    Ok(json!(n * 2))
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    let worker = Worker::with_client(test_config(38013), registry, mock.clone());
    worker.start().await.unwrap();

    assert!(worker.dispatch(work("exec-1", "double")).await);
    assert!(
        wait_until(|| !mock.completions.lock().is_empty(), Duration::from_secs(2)).await,
        "completion was never reported"
    );
    let (execution_id, completion) = mock.completions.lock()[0].clone();
    assert_eq!(execution_id, "exec-1");
    assert_eq!(completion.result, json!(42));
    assert_eq!(completion.worker_id, "wrk_observed");
    assert_eq!(worker.active_count(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_workflow_is_refused() {
    let mock = ObserverOrchestrator::new();
    let worker = Worker::with_client(test_config(38014), Arc::new(Registry::new()), mock.clone());
    worker.start().await.unwrap();

    assert!(!worker.dispatch(work("exec-1", "ghost")).await);
    assert!(mock.completions.lock().is_empty());
    assert!(mock.failures.lock().is_empty());

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrency_limit_and_reentry_are_enforced() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());
    registry.register(cancellable_workflow("slow")).unwrap();

    let mut cfg = test_config(38015);
    cfg.max_concurrent_workflows = 1;
    let worker = Worker::with_client(cfg, registry, mock.clone());
    worker.start().await.unwrap();

    assert!(worker.dispatch(work("exec-1", "slow")).await);
    // Over the cap.
    assert!(!worker.dispatch(work("exec-2", "slow")).await);
    // Re-entry of an active execution.
    assert!(!worker.dispatch(work("exec-1", "slow")).await);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_aborts_a_running_execution() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());
    registry.register(cancellable_workflow("parked")).unwrap();

    let worker = Worker::with_client(test_config(38016), registry, mock.clone());
    worker.start().await.unwrap();

    assert!(worker.dispatch(work("exec-1", "parked")).await);
    assert!(
        worker
            .cancel(CancelWorkRequest {
                execution_id: "exec-1".into()
            })
            .await
    );
    assert!(
        wait_until(
            || !mock.cancel_confirms.lock().is_empty(),
            Duration::from_secs(2)
        )
        .await,
        "cancellation was never confirmed"
    );
    assert_eq!(mock.cancel_confirms.lock().as_slice(), ["exec-1"]);

    // Unknown executions are not cancellable.
    assert!(
        !worker
            .cancel(CancelWorkRequest {
                execution_id: "ghost".into()
            })
            .await
    );

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn run_timeout_fires_the_abort_token() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());
    registry.register(cancellable_workflow("parked")).unwrap();

    let worker = Worker::with_client(test_config(38017), registry, mock.clone());
    worker.start().await.unwrap();

    let mut req = work("exec-1", "parked");
    req.run_timeout_seconds = Some(1);
    assert!(worker.dispatch(req).await);

    assert!(
        wait_until(
            || !mock.cancel_confirms.lock().is_empty(),
            Duration::from_secs(3)
        )
        .await,
        "timeout never aborted the execution"
    );

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn heartbeat_re_register_repeats_the_sequence() {
    let mock = ObserverOrchestrator::new();
    mock.re_register_on.lock().push(1);

    let registry = Arc::new(Registry::new());
    let mut cfg = test_config(38018);
    cfg.heartbeat_interval_secs = 1;
    let worker = Worker::with_client(cfg, registry, mock.clone());
    worker.start().await.unwrap();
    assert_eq!(mock.register_worker_calls.lock().len(), 1);

    assert!(
        wait_until(
            || mock.register_worker_calls.lock().len() >= 2,
            Duration::from_secs(4)
        )
        .await,
        "re-registration never happened"
    );
    // The full sequence ran again, including the online marker.
    assert!(*mock.online.lock() >= 2);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_aborts_active_executions_and_drains() {
    let mock = ObserverOrchestrator::new();
    let registry = Arc::new(Registry::new());
    registry.register(cancellable_workflow("parked")).unwrap();

    let worker = Worker::with_client(test_config(38019), registry, mock.clone());
    worker.start().await.unwrap();
    assert!(worker.dispatch(work("exec-1", "parked")).await);
    assert_eq!(worker.active_count(), 1);

    worker.shutdown().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(worker.active_count(), 0);
    assert_eq!(mock.cancel_confirms.lock().as_slice(), ["exec-1"]);

    // A stopped worker refuses new work.
    assert!(!worker.dispatch(work("exec-2", "parked")).await);
}
