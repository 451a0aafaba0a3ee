//! Runs a workflow handler atop the step protocol and classifies the
//! outcome as OK / WAIT / CANCELLED / FAIL.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use polos_client::OrchestratorApi;
use polos_domain::error::{Error, Result};
use polos_protocol::{
    event_types, ConfirmCancellationRequest, FormField, FormFieldType, FormSpec, SuspendForm,
    WorkRequest,
};

use crate::agent::run_agent;
use crate::context::{ExecutionContext, WorkflowContext};
use crate::definition::{WorkflowDefinition, WorkflowKind};
use crate::hooks::{run_hooks, HookPhase};
use crate::registry::Registry;
use crate::step::Step;
use crate::store::StepStore;

/// Terminal classification of one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed {
        result: Value,
        final_state: Option<Value>,
    },
    /// Suspended — no failure reporting; the orchestrator re-dispatches.
    Waiting,
    /// Cancel confirmed and the terminal event emitted.
    Cancelled,
    Failed {
        error: String,
        retryable: bool,
    },
}

pub struct Executor {
    client: Arc<dyn OrchestratorApi>,
    registry: Arc<Registry>,
    agent_max_steps: u32,
}

impl Executor {
    pub fn new(client: Arc<dyn OrchestratorApi>, registry: Arc<Registry>, agent_max_steps: u32) -> Self {
        Self {
            client,
            registry,
            agent_max_steps,
        }
    }

    /// Execute one dispatched attempt to a terminal classification. Never
    /// returns an error — every failure mode folds into the outcome.
    pub async fn execute(
        &self,
        def: Arc<WorkflowDefinition>,
        req: &WorkRequest,
        cancel: CancellationToken,
        worker_id: &str,
    ) -> ExecutionOutcome {
        let ctx = ExecutionContext::from_work_request(req, cancel);
        let (trace_id, parent_span_id) = ctx.trace_identity();
        let span = tracing::info_span!(
            "workflow.execute",
            workflow_id = %ctx.workflow_id,
            execution_id = %ctx.execution_id,
            retry_count = ctx.retry_count,
            "otel.kind" = polos_domain::trace::span_kind_for("workflow.execute"),
            trace_id = tracing::field::Empty,
            parent_span_id = tracing::field::Empty,
        );
        if let Some(trace_id) = trace_id {
            span.record("trace_id", trace_id.as_str());
        }
        if let Some(parent_span_id) = parent_span_id {
            span.record("parent_span_id", parent_span_id.as_str());
        }
        self.execute_inner(def, req, ctx, worker_id)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        def: Arc<WorkflowDefinition>,
        req: &WorkRequest,
        ctx: ExecutionContext,
        worker_id: &str,
    ) -> ExecutionOutcome {
        // Hydrate the fresh step store from the orchestrator's record so
        // replay satisfies the memoisation invariants.
        let store = Arc::new(StepStore::new());
        match self.client.list_steps(&ctx.execution_id).await {
            Ok(resp) => store.hydrate(resp.steps),
            Err(e) => {
                return ExecutionOutcome::Failed {
                    error: format!("step hydration failed: {e}"),
                    retryable: true,
                }
            }
        }

        if let Some(schema) = &def.input_schema {
            if let Err(e) = schema.validate(&req.payload) {
                return ExecutionOutcome::Failed {
                    error: format!("input validation failed: {e}"),
                    retryable: false,
                };
            }
        }

        let step = Step::new(ctx.clone(), store, self.client.clone());
        let wctx = Arc::new(WorkflowContext::new(
            ctx.clone(),
            step.clone(),
            self.registry.clone(),
        ));

        let result = self.run_phases(&wctx, &def, req.payload.clone()).await;
        let final_state = wctx.state();

        match result {
            Ok(output) => {
                if let Err(e) = step
                    .publish_workflow_event(
                        Some(event_types::WORKFLOW_FINISH),
                        json!({ "result": output }),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "workflow_finish event publication failed");
                }
                ExecutionOutcome::Completed {
                    result: output,
                    final_state,
                }
            }
            Err(e) if e.is_wait() => {
                tracing::debug!(error = %e, "execution suspended");
                ExecutionOutcome::Waiting
            }
            Err(Error::Cancelled) => self.confirm_cancel(&step, &ctx, worker_id).await,
            Err(e) if ctx.is_cancelled() => {
                tracing::debug!(error = %e, "failure after abort, treating as cancelled");
                self.confirm_cancel(&step, &ctx, worker_id).await
            }
            Err(e) => {
                // Tool failures must reach the calling LLM, never the
                // orchestrator's retry policy.
                let retryable = e.is_retryable() && def.kind != WorkflowKind::Tool;
                ExecutionOutcome::Failed {
                    error: e.to_string(),
                    retryable,
                }
            }
        }
    }

    /// onStart hooks → handler → onEnd hooks.
    async fn run_phases(
        &self,
        wctx: &Arc<WorkflowContext>,
        def: &Arc<WorkflowDefinition>,
        payload: Value,
    ) -> Result<Value> {
        let step = &wctx.step;
        let ctx = &wctx.execution;

        let payload = if def.on_start.is_empty() {
            payload
        } else {
            run_hooks(
                step,
                ctx,
                &def.on_start,
                "on_start",
                HookPhase::OnStart,
                payload,
                None,
            )
            .await?
            .0
        };

        let output = match def.kind {
            WorkflowKind::Agent => {
                run_agent(wctx, def, payload.clone(), self.agent_max_steps).await?
            }
            WorkflowKind::Tool => {
                self.approval_gate(wctx, def, &payload).await?;
                let handler = def
                    .handler
                    .as_ref()
                    .ok_or_else(|| Error::Config(format!("tool '{}' has no handler", def.id)))?;
                handler.call(wctx.clone(), payload.clone()).await?
            }
            WorkflowKind::Workflow => {
                let handler = def.handler.as_ref().ok_or_else(|| {
                    Error::Config(format!("workflow '{}' has no handler", def.id))
                })?;
                handler.call(wctx.clone(), payload.clone()).await?
            }
        };

        if def.on_end.is_empty() {
            return Ok(output);
        }
        let (_, modified_output) = run_hooks(
            step,
            ctx,
            &def.on_end,
            "on_end",
            HookPhase::OnEnd,
            payload,
            Some(output.clone()),
        )
        .await?;
        Ok(modified_output.unwrap_or(output))
    }

    /// Human-in-the-loop gate for tool executions.
    ///
    /// Suspends with a rendered `_form`; a rejection raises with the
    /// user's feedback, an approval falls through to the handler.
    async fn approval_gate(
        &self,
        wctx: &Arc<WorkflowContext>,
        def: &Arc<WorkflowDefinition>,
        payload: &Value,
    ) -> Result<()> {
        let Some(tool_cfg) = &def.tool else {
            return Ok(());
        };
        if !tool_cfg.approval.requires_approval(payload) {
            return Ok(());
        }

        let form = approval_form(&def.id, payload);
        let resume = wctx
            .step
            .suspend("approval", Some(serde_json::to_value(form)?), None)
            .await?;

        let approved = resume
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !approved {
            let feedback = resume
                .get("feedback")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned();
            return Err(Error::Other(format!(
                "Tool \"{}\" was rejected by the user. Feedback: {feedback}",
                def.id
            )));
        }
        Ok(())
    }

    async fn confirm_cancel(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        worker_id: &str,
    ) -> ExecutionOutcome {
        if let Err(e) = step
            .publish_workflow_event(Some(event_types::WORKFLOW_CANCEL), json!({}))
            .await
        {
            tracing::warn!(error = %e, "workflow_cancel event publication failed");
        }
        if let Err(e) = self
            .client
            .confirm_cancellation(
                &ctx.execution_id,
                ConfirmCancellationRequest {
                    worker_id: worker_id.to_owned(),
                },
            )
            .await
        {
            tracing::warn!(error = %e, "cancellation confirmation failed");
        }
        ExecutionOutcome::Cancelled
    }
}

/// The approval `_form` rendered by external channels.
fn approval_form(tool_id: &str, payload: &Value) -> SuspendForm {
    SuspendForm {
        form: FormSpec {
            title: format!("Approve tool: {tool_id}"),
            description: format!("The agent wants to run \"{tool_id}\". Approve?"),
            fields: vec![
                FormField {
                    key: "approved".into(),
                    field_type: FormFieldType::Boolean,
                    label: "Approve".into(),
                    description: None,
                    required: Some(true),
                    default: None,
                    options: None,
                },
                FormField {
                    key: "feedback".into(),
                    field_type: FormFieldType::Textarea,
                    label: "Feedback".into(),
                    description: Some("Optional feedback for the agent".into()),
                    required: Some(false),
                    default: None,
                    options: None,
                },
            ],
            context: json!({ "arguments": payload }),
        },
        source: "polos".into(),
        tool: Some(tool_id.to_owned()),
    }
}
