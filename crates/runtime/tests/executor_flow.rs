//! Executor classification tests: OK / WAIT / CANCELLED / FAIL, lifecycle
//! hooks, and the human-approval gate.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::*;
use polos_client::OrchestratorApi;
use polos_domain::error::{Error, Result};
use polos_runtime::{
    handler_fn, ApprovalPolicy, ExecutionContext, ExecutionOutcome, Executor, Hook, HookContext,
    HookResult, InvokeOptions, Registry, RunOptions, WorkflowDefinition,
};

fn executor(mock: &Arc<MockOrchestrator>, registry: &Arc<Registry>) -> Executor {
    Executor::new(
        mock.clone() as Arc<dyn OrchestratorApi>,
        registry.clone(),
        20,
    )
}

// ── OK ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_return_classifies_as_completed() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("double")
        .handler(handler_fn(|_ctx, payload| async move {
            let n = payload["n"].as_i64().unwrap_or(0);
            Ok(json!({"doubled": n * 2}))
        }))
        .build()
        .unwrap();

    let mut req = work_request("exec-1", "double");
    req.payload = json!({"n": 21});

    let outcome = executor(&mock, &registry)
        .execute(def, &req, CancellationToken::new(), "wrk_test")
        .await;

    match outcome {
        ExecutionOutcome::Completed { result, .. } => {
            assert_eq!(result, json!({"doubled": 42}));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
    assert!(mock
        .event_types_published()
        .iter()
        .any(|t| t == "workflow_finish"));
}

#[tokio::test]
async fn final_state_is_surfaced() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("stateful")
        .handler(handler_fn(|ctx, _payload| async move {
            ctx.set_state(json!({"progress": "complete"}));
            Ok(json!("ok"))
        }))
        .build()
        .unwrap();

    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-1", "stateful"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;

    match outcome {
        ExecutionOutcome::Completed { final_state, .. } => {
            assert_eq!(final_state, Some(json!({"progress": "complete"})));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

// ── WAIT ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn suspension_classifies_as_waiting_without_failure_reporting() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("parent")
        .handler(handler_fn(|ctx, _payload| async move {
            ctx.step
                .invoke_and_wait("sub", "child", json!({}), InvokeOptions::default())
                .await
        }))
        .build()
        .unwrap();

    let outcome = executor(&mock, &registry)
        .execute(
            def.clone(),
            &work_request("exec-1", "parent"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    assert!(matches!(outcome, ExecutionOutcome::Waiting));
    assert!(mock.failures.lock().is_empty());

    // The child completes; re-dispatch finishes the workflow.
    mock.behave("child", |_| json!("ok"));
    mock.resolve_sub_executions(&["sub-exec-1".into()]);

    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-1", "parent"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Completed { result, .. } => assert_eq!(result, json!("ok")),
        other => panic!("expected Completed, got {other:?}"),
    }
}

// ── FAIL ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failures_carry_retryability() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());

    // Plain failure: retryable.
    let def = WorkflowDefinition::workflow("boom")
        .handler(handler_fn(|_ctx, _p| async move {
            Err::<Value, _>(Error::Other("exploded".into()))
        }))
        .build()
        .unwrap();
    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-1", "boom"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Failed { error, retryable } => {
            assert!(error.contains("exploded"));
            assert!(retryable);
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    // Exhausted step retries: terminal.
    let def = WorkflowDefinition::workflow("step-boom")
        .handler(handler_fn(|ctx, _p| async move {
            ctx.step
                .run(
                    "always-fails",
                    || async { Err::<Value, _>(Error::Http("bad upstream".into())) },
                    RunOptions {
                        max_retries: 0,
                        ..Default::default()
                    },
                )
                .await
        }))
        .build()
        .unwrap();
    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-2", "step-boom"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Failed { retryable, .. } => assert!(!retryable),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn tool_failures_are_never_retryable() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::tool("fragile", "a tool that fails", json!({"type": "object"}))
        .handler(handler_fn(|_ctx, _p| async move {
            Err::<Value, _>(Error::Other("tool broke".into()))
        }))
        .build()
        .unwrap();

    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-1", "fragile"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Failed { retryable, .. } => assert!(!retryable),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn input_validation_rejects_before_the_handler() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("strict")
        .input_schema(polos_runtime::JsonSchema::new(json!({
            "type": "object",
            "required": ["name"],
        })))
        .handler(handler_fn(|_ctx, _p| async move { Ok(json!("ran")) }))
        .build()
        .unwrap();

    let mut req = work_request("exec-1", "strict");
    req.payload = json!({"wrong": true});

    let outcome = executor(&mock, &registry)
        .execute(def, &req, CancellationToken::new(), "wrk_test")
        .await;
    match outcome {
        ExecutionOutcome::Failed { error, retryable } => {
            assert!(error.contains("validation"));
            assert!(!retryable);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

// ── CANCELLED ───────────────────────────────────────────────────────────

#[tokio::test]
async fn abort_signal_classifies_as_cancelled_and_confirms() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("slow")
        .handler(handler_fn(|ctx, _p| async move {
            ctx.step
                .run("work", || async { Ok(json!(1)) }, RunOptions::default())
                .await
        }))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = executor(&mock, &registry)
        .execute(def, &work_request("exec-1", "slow"), cancel, "wrk_test")
        .await;
    assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    assert!(mock
        .event_types_published()
        .iter()
        .any(|t| t == "workflow_cancel"));
    assert_eq!(mock.cancel_confirms.lock().as_slice(), ["exec-1"]);
}

// ── Lifecycle hooks ─────────────────────────────────────────────────────

struct PayloadStamp;

#[async_trait]
impl Hook for PayloadStamp {
    fn name(&self) -> &str {
        "payload_stamp"
    }

    async fn run(&self, _ctx: &ExecutionContext, hook_ctx: &HookContext) -> Result<HookResult> {
        let mut payload = hook_ctx.current_payload.clone();
        payload["stamped"] = json!(true);
        Ok(HookResult::proceed().with_payload(payload))
    }
}

struct OutputStamp;

#[async_trait]
impl Hook for OutputStamp {
    fn name(&self) -> &str {
        "output_stamp"
    }

    async fn run(&self, _ctx: &ExecutionContext, hook_ctx: &HookContext) -> Result<HookResult> {
        let mut output = hook_ctx.current_output.clone().unwrap_or(json!({}));
        output["finalised"] = json!(true);
        Ok(HookResult::proceed().with_output(output))
    }
}

struct Blocker;

#[async_trait]
impl Hook for Blocker {
    fn name(&self) -> &str {
        "blocker"
    }

    async fn run(&self, _ctx: &ExecutionContext, _hook_ctx: &HookContext) -> Result<HookResult> {
        Ok(HookResult::stop("not allowed"))
    }
}

#[tokio::test]
async fn hooks_thread_modifications_through_the_phases() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("hooked")
        .on_start(Arc::new(PayloadStamp))
        .on_end(Arc::new(OutputStamp))
        .handler(handler_fn(|_ctx, payload| async move {
            Ok(json!({"saw_stamp": payload["stamped"]}))
        }))
        .build()
        .unwrap();

    let mut req = work_request("exec-1", "hooked");
    req.payload = json!({});

    let outcome = executor(&mock, &registry)
        .execute(def, &req, CancellationToken::new(), "wrk_test")
        .await;
    match outcome {
        ExecutionOutcome::Completed { result, .. } => {
            assert_eq!(result, json!({"saw_stamp": true, "finalised": true}));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_hook_stops_the_phase() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::workflow("blocked")
        .on_start(Arc::new(Blocker))
        .handler(handler_fn(|_ctx, _p| async move { Ok(json!("unreached")) }))
        .build()
        .unwrap();

    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-1", "blocked"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Failed { error, .. } => {
            assert!(error.contains("blocker"));
            assert!(error.contains("not allowed"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

// ── Human approval ──────────────────────────────────────────────────

fn approval_tool() -> Arc<WorkflowDefinition> {
    WorkflowDefinition::tool("dangerous_tool", "needs a human", json!({"type": "object"}))
        .approval(ApprovalPolicy::Always)
        .handler(handler_fn(|_ctx, _p| async move { Ok(json!("tool ran")) }))
        .build()
        .unwrap()
}

#[tokio::test]
async fn approval_rejection_raises_with_feedback() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = approval_tool();

    // First dispatch: suspends with the rendered form.
    let outcome = executor(&mock, &registry)
        .execute(
            def.clone(),
            &work_request("exec-1", "dangerous_tool"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    assert!(matches!(outcome, ExecutionOutcome::Waiting));

    let events = mock.events.lock().clone();
    let suspend = &events[0].events[0];
    assert_eq!(suspend.event_type, "suspend_approval");
    let fields = suspend.data["_form"]["fields"].as_array().unwrap();
    let keys: Vec<_> = fields.iter().map(|f| f["key"].as_str().unwrap()).collect();
    assert_eq!(keys, vec!["approved", "feedback"]);
    assert_eq!(fields[0]["type"], "boolean");
    assert_eq!(fields[1]["type"], "textarea");
    assert_eq!(suspend.data["_tool"], "dangerous_tool");

    // Rejected with feedback.
    mock.record_step("approval", json!({"approved": false, "feedback": "no"}));
    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-1", "dangerous_tool"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Failed { error, retryable } => {
            assert_eq!(
                error,
                "Tool \"dangerous_tool\" was rejected by the user. Feedback: no"
            );
            assert!(!retryable);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn approval_runs_the_handler() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = approval_tool();

    let outcome = executor(&mock, &registry)
        .execute(
            def.clone(),
            &work_request("exec-2", "dangerous_tool"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    assert!(matches!(outcome, ExecutionOutcome::Waiting));

    mock.record_step("approval", json!({"approved": true}));
    let outcome = executor(&mock, &registry)
        .execute(
            def,
            &work_request("exec-2", "dangerous_tool"),
            CancellationToken::new(),
            "wrk_test",
        )
        .await;
    match outcome {
        ExecutionOutcome::Completed { result, .. } => assert_eq!(result, json!("tool ran")),
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn path_restricted_approval_only_gates_matching_arguments() {
    let mock = MockOrchestrator::new();
    let registry = Arc::new(Registry::new());
    let def = WorkflowDefinition::tool("fs_write", "writes files", json!({"type": "object"}))
        .approval(ApprovalPolicy::path_restricted(["^/etc/"]).unwrap())
        .handler(handler_fn(|_ctx, _p| async move { Ok(json!("wrote")) }))
        .build()
        .unwrap();

    // Safe path: no gate.
    let mut req = work_request("exec-1", "fs_write");
    req.payload = json!({"path": "/tmp/out.txt"});
    let outcome = executor(&mock, &registry)
        .execute(def.clone(), &req, CancellationToken::new(), "wrk_test")
        .await;
    assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));

    // Restricted path: suspends for approval.
    let mut req = work_request("exec-2", "fs_write");
    req.payload = json!({"path": "/etc/passwd"});
    let outcome = executor(&mock, &registry)
        .execute(def, &req, CancellationToken::new(), "wrk_test")
        .await;
    assert!(matches!(outcome, ExecutionOutcome::Waiting));
}
