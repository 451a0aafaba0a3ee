//! Shared test doubles: an in-memory orchestrator and a scripted LLM.
//!
//! The mock orchestrator records every call and can "resolve" pending
//! sub-executions the way the real service would — by recording a step
//! result under the invoking step key — so tests can drive suspend →
//! re-dispatch → replay cycles without a network.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use polos_client::OrchestratorApi;
use polos_domain::error::{Error, Result, WaitReason};
use polos_domain::ConversationMessage;
use polos_llm::{BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent};
use polos_protocol::*;
use polos_runtime::{ExecutionContext, Step, StepStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MockOrchestrator {
    pub reported_steps: Mutex<Vec<StepReportRequest>>,
    pub extra_records: Mutex<Vec<StepRecord>>,
    pub events: Mutex<Vec<PublishEventsRequest>>,
    pub invokes: Mutex<Vec<InvokeExecutionRequest>>,
    pub timers: Mutex<Vec<RegisterTimerRequest>>,
    pub subscriptions: Mutex<Vec<SubscribeEventRequest>>,
    pub completions: Mutex<Vec<(String, CompleteExecutionRequest)>>,
    pub failures: Mutex<Vec<(String, FailExecutionRequest)>>,
    pub cancel_confirms: Mutex<Vec<String>>,
    pub session_memory: Mutex<HashMap<String, SessionMemory>>,
    /// tool/workflow id → result factory for resolved sub-executions.
    pub sub_behavior: Mutex<HashMap<String, Arc<dyn Fn(&Value) -> Value + Send + Sync>>>,
    invoke_counter: Mutex<u64>,
}

impl MockOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Configure the result a resolved sub-execution of `workflow_id`
    /// produces from its payload.
    pub fn behave(&self, workflow_id: &str, f: impl Fn(&Value) -> Value + Send + Sync + 'static) {
        self.sub_behavior
            .lock()
            .insert(workflow_id.to_owned(), Arc::new(f));
    }

    /// All step records a fresh dispatch would hydrate with.
    pub fn step_records(&self) -> Vec<StepRecord> {
        let mut records: Vec<StepRecord> = self
            .reported_steps
            .lock()
            .iter()
            .filter_map(|r| {
                r.result.as_ref().map(|result| StepRecord {
                    key: r.key.clone(),
                    result: result.clone(),
                    completed_at: r.completed_at,
                })
            })
            .collect();
        records.extend(self.extra_records.lock().iter().cloned());
        records
    }

    /// Record a step result directly, as the orchestrator does when a
    /// timer fires, an event arrives, or a sub-execution completes.
    pub fn record_step(&self, key: &str, result: Value) {
        self.extra_records.lock().push(StepRecord {
            key: key.into(),
            result,
            completed_at: Utc::now(),
        });
    }

    /// Resolve the sub-executions a WAIT is pending on, recording each
    /// child's result under its invoking step key.
    pub fn resolve_sub_executions(&self, execution_ids: &[String]) {
        let invokes = self.invokes.lock().clone();
        for (i, invoke) in invokes.iter().enumerate() {
            let execution_id = format!("sub-exec-{}", i + 1);
            if !execution_ids.contains(&execution_id) {
                continue;
            }
            let behavior = self.sub_behavior.lock().get(&invoke.workflow_id).cloned();
            let result = match behavior {
                Some(f) => f(&invoke.payload),
                None => json!({ "__error": format!("no behavior for '{}'", invoke.workflow_id) }),
            };
            self.record_step(&invoke.step_key, result);
        }
    }

    pub fn reported_result(&self, key: &str) -> Option<Value> {
        self.reported_steps
            .lock()
            .iter()
            .find(|r| r.key == key)
            .and_then(|r| r.result.clone())
    }

    pub fn reported_error(&self, key: &str) -> Option<String> {
        self.reported_steps
            .lock()
            .iter()
            .find(|r| r.key == key)
            .and_then(|r| r.error.clone())
    }

    pub fn event_types_published(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .flat_map(|req| req.events.iter().map(|e| e.event_type.clone()))
            .collect()
    }
}

#[async_trait]
impl OrchestratorApi for MockOrchestrator {
    async fn register_worker(&self, _req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        Ok(RegisterWorkerResponse {
            worker_id: "wrk_test".into(),
        })
    }

    async fn register_deployment(&self, _req: RegisterDeploymentRequest) -> Result<()> {
        Ok(())
    }

    async fn register_agent(&self, _req: RegisterAgentRequest) -> Result<()> {
        Ok(())
    }

    async fn register_tool(&self, _req: RegisterToolRequest) -> Result<()> {
        Ok(())
    }

    async fn register_workflow(&self, _d: &str, _req: RegisterWorkflowRequest) -> Result<()> {
        Ok(())
    }

    async fn register_queues(&self, _req: RegisterQueuesRequest) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _worker_id: &str) -> Result<HeartbeatResponse> {
        Ok(HeartbeatResponse::default())
    }

    async fn mark_online(&self, _worker_id: &str) -> Result<()> {
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

    async fn report_step(&self, _execution_id: &str, req: StepReportRequest) -> Result<()> {
        self.reported_steps.lock().push(req);
        Ok(())
    }

    async fn list_steps(&self, _execution_id: &str) -> Result<ListStepsResponse> {
        Ok(ListStepsResponse {
            steps: self.step_records(),
        })
    }

    async fn invoke_execution(
        &self,
        req: InvokeExecutionRequest,
    ) -> Result<InvokeExecutionResponse> {
        // Dedup by step key, as the real orchestrator does.
        {
            let invokes = self.invokes.lock();
            if let Some(pos) = invokes.iter().position(|i| i.step_key == req.step_key) {
                return Ok(InvokeExecutionResponse {
                    execution_id: format!("sub-exec-{}", pos + 1),
                });
            }
        }
        let mut counter = self.invoke_counter.lock();
        *counter += 1;
        let execution_id = format!("sub-exec-{counter}");
        self.invokes.lock().push(req);
        Ok(InvokeExecutionResponse { execution_id })
    }

    async fn get_execution(&self, _execution_id: &str) -> Result<ExecutionStatusResponse> {
        Ok(ExecutionStatusResponse {
            status: ExecutionStatus::Completed,
            result: Some(json!("ok")),
            error: None,
        })
    }

    async fn cancel_execution(&self, _execution_id: &str) -> Result<()> {
        Ok(())
    }

    async fn register_timer(&self, _execution_id: &str, req: RegisterTimerRequest) -> Result<()> {
        self.timers.lock().push(req);
        Ok(())
    }

    async fn subscribe_event(&self, _execution_id: &str, req: SubscribeEventRequest) -> Result<()> {
        self.subscriptions.lock().push(req);
        Ok(())
    }

    async fn publish_events(&self, req: PublishEventsRequest) -> Result<()> {
        self.events.lock().push(req);
        Ok(())
    }

    async fn get_session_memory(&self, session_id: &str) -> Result<SessionMemory> {
        Ok(self
            .session_memory
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_session_memory(&self, session_id: &str, memory: &SessionMemory) -> Result<()> {
        self.session_memory
            .lock()
            .insert(session_id.to_owned(), memory.clone());
        Ok(())
    }

    async fn export_spans(&self, _req: SpanBatchRequest) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub tokens_per_message: u64,
    model: String,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Self::with_tokens_per_message(responses, 10)
    }

    /// A scripted provider whose token estimator charges a fixed price per
    /// message (compaction tests dial this up).
    pub fn with_tokens_per_message(responses: Vec<ChatResponse>, tokens: u64) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            tokens_per_message: tokens,
            model: "scripted-1".into(),
        })
    }

    pub fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            tool_calls: vec![],
            usage: Some(polos_domain::Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                ..Default::default()
            }),
            model: "scripted-1".into(),
            finish_reason: Some("stop".into()),
            raw_output: None,
        }
    }

    pub fn tool_call_response(name: &str, call_id: &str, arguments: &str) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![polos_domain::ToolCall::new(call_id, name, arguments)],
            usage: Some(polos_domain::Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                ..Default::default()
            }),
            model: "scripted-1".into(),
            finish_reason: Some("tool_calls".into()),
            raw_output: None,
        }
    }

    fn pop(&self) -> Result<ChatResponse> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Other("scripted LLM ran out of responses".into()))
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req);
        self.pop()
    }

    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req);
        let resp = self.pop()?;
        let mut events = Vec::new();
        if !resp.content.is_empty() {
            events.push(StreamEvent::TextDelta {
                text: resp.content.clone(),
            });
        }
        for call in &resp.tool_calls {
            events.push(StreamEvent::ToolCallFinished {
                call_id: call.call_id.clone(),
                tool_name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            });
        }
        events.push(StreamEvent::Done {
            usage: resp.usage.clone(),
            finish_reason: resp.finish_reason.clone(),
        });
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn estimate_tokens(&self, messages: &[ConversationMessage]) -> u64 {
        messages.len() as u64 * self.tokens_per_message
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn work_request(execution_id: &str, workflow_id: &str) -> WorkRequest {
    WorkRequest {
        execution_id: execution_id.into(),
        workflow_id: workflow_id.into(),
        deployment_id: "dep-test".into(),
        payload: Value::Null,
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
        created_at: Utc::now(),
    }
}

pub fn execution_ctx(execution_id: &str, workflow_id: &str) -> ExecutionContext {
    ExecutionContext::from_work_request(
        &work_request(execution_id, workflow_id),
        CancellationToken::new(),
    )
}

/// A fresh attempt: new store hydrated from everything the mock has
/// recorded, the way a re-dispatch would.
pub fn fresh_step(mock: &Arc<MockOrchestrator>, ctx: &ExecutionContext) -> Step {
    let store = Arc::new(StepStore::new());
    store.hydrate(mock.step_records());
    Step::new(
        ctx.clone(),
        store,
        mock.clone() as Arc<dyn OrchestratorApi>,
    )
}

/// Extract the pending sub-execution ids from a WAIT signal.
pub fn pending_ids(err: &Error) -> Vec<String> {
    match err {
        Error::Wait(pending) => match &pending.reason {
            WaitReason::SubExecutions { execution_ids } => execution_ids.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
