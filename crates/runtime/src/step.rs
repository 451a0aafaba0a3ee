//! The durable step protocol.
//!
//! Every operation is idempotent with respect to its string key: the first
//! evaluation commits an outcome to the per-execution [`StepStore`] and
//! reports it to the orchestrator; replays hit the cache and return the
//! recorded value without re-running anything.
//!
//! Operations that cannot complete in-task (`invoke_and_wait`, the waits,
//! `suspend`) return [`Error::Wait`] — the executor reports WAIT and the
//! task exits. Re-dispatch happens when the dependency resolves; by then
//! the orchestrator has recorded the step result and hydration satisfies
//! the replay.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use polos_client::OrchestratorApi;
use polos_domain::error::{Error, Result, WaitPending, WaitReason};
use polos_protocol::{
    resume_event_type, suspend_event_type, workflow_topic, EventEnvelope, ExecutionStatus,
    InvokeExecutionRequest, PublishEventsRequest, RegisterTimerRequest, StepReportRequest,
    SubscribeEventRequest,
};

use crate::context::ExecutionContext;
use crate::store::{Claim, StepKind, StepStore};

/// Marker the orchestrator records as a child step result when the
/// sub-execution failed terminally. The agent loop textualises it; plain
/// callers get an error.
pub const SUB_ERROR_KEY: &str = "__error";

/// Marker recorded when an event subscription timed out.
pub const EVENT_TIMEOUT_KEY: &str = "__timedOut";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retry policy and observability input for [`Step::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Observability only: recorded on the step span, never persisted.
    pub input: Option<Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            input: None,
        }
    }
}

impl RunOptions {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Duration spec for [`Step::wait_for`]. The minimum wait unit is one
/// second; empty specs are clamped up.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitDuration {
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
    pub weeks: u64,
}

impl WaitDuration {
    pub fn seconds(n: u64) -> Self {
        Self {
            seconds: n,
            ..Default::default()
        }
    }

    pub fn minutes(n: u64) -> Self {
        Self {
            minutes: n,
            ..Default::default()
        }
    }

    pub fn total_seconds(&self) -> u64 {
        (self.seconds
            + self.minutes * 60
            + self.hours * 3_600
            + self.days * 86_400
            + self.weeks * 604_800)
            .max(1)
    }
}

/// Routing options for sub-workflow invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub queue: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// Target of a [`Step::resume`] call: the suspended execution to unblock.
#[derive(Debug, Clone)]
pub struct ResumeTarget {
    pub suspend_workflow_id: String,
    pub suspend_execution_id: String,
    pub suspend_step_key: String,
    pub data: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invoke handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to a fire-and-forget sub-execution.
#[derive(Clone)]
pub struct InvokeHandle {
    pub execution_id: String,
    client: Arc<dyn OrchestratorApi>,
}

impl std::fmt::Debug for InvokeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeHandle")
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl InvokeHandle {
    pub async fn get_status(&self) -> Result<polos_protocol::ExecutionStatusResponse> {
        self.client.get_execution(&self.execution_id).await
    }

    /// Poll until the sub-execution reaches a terminal state. Keeps the
    /// task alive; for cooperative waiting use `invoke_and_wait` instead.
    pub async fn wait_for_result(&self) -> Result<Value> {
        loop {
            let status = self.get_status().await?;
            match status.status {
                ExecutionStatus::Completed => return Ok(status.result.unwrap_or(Value::Null)),
                ExecutionStatus::Failed => {
                    return Err(Error::Other(
                        status
                            .error
                            .unwrap_or_else(|| "sub-workflow failed".to_owned()),
                    ))
                }
                ExecutionStatus::Cancelled => return Err(Error::Cancelled),
                _ => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }

    pub async fn cancel(&self) -> Result<()> {
        self.client.cancel_execution(&self.execution_id).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StepShared {
    ctx: ExecutionContext,
    store: Arc<StepStore>,
    client: Arc<dyn OrchestratorApi>,
}

/// Cloneable handle to the durable step protocol for one execution.
#[derive(Clone)]
pub struct Step {
    inner: Arc<StepShared>,
}

impl Step {
    pub fn new(
        ctx: ExecutionContext,
        store: Arc<StepStore>,
        client: Arc<dyn OrchestratorApi>,
    ) -> Self {
        Self {
            inner: Arc::new(StepShared { ctx, store, client }),
        }
    }

    pub fn store(&self) -> &Arc<StepStore> {
        &self.inner.store
    }

    pub fn client(&self) -> &Arc<dyn OrchestratorApi> {
        &self.inner.client
    }

    fn ctx(&self) -> &ExecutionContext {
        &self.inner.ctx
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.ctx().is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn report(&self, key: &str, result: Option<Value>, error: Option<String>) -> Result<()> {
        self.inner
            .client
            .report_step(
                &self.ctx().execution_id,
                StepReportRequest {
                    key: key.to_owned(),
                    result,
                    error,
                    completed_at: Utc::now(),
                },
            )
            .await
    }

    /// Commit locally and report to the orchestrator.
    async fn commit_and_report(&self, key: &str, value: Value) -> Result<Value> {
        self.inner.store.commit(key, value.clone());
        self.report(key, Some(value.clone()), None).await?;
        Ok(value)
    }

    // ── run ──────────────────────────────────────────────────────────

    /// Run `f` at most once per execution under `key`.
    ///
    /// Exceptions retry with exponential back-off (capped) up to
    /// `max_retries`; exhausted retries report the error and raise
    /// `StepExecutionError`, which is not retryable at the workflow layer.
    pub async fn run<F, Fut>(&self, key: &str, f: F, opts: RunOptions) -> Result<Value>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Value>> + Send,
    {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Run)? {
            return Ok(value);
        }

        let span = tracing::info_span!(
            "step.run",
            step_key = %key,
            input = tracing::field::Empty,
            attempts = tracing::field::Empty,
        );
        if let Some(input) = &opts.input {
            span.record("input", tracing::field::display(input));
        }

        async {
            let mut attempt: u32 = 0;
            loop {
                match f().await {
                    Ok(value) => {
                        tracing::Span::current().record("attempts", attempt + 1);
                        return self.commit_and_report(key, value).await;
                    }
                    // Suspension and cancellation pass through untouched,
                    // as do deterministic domain signals — retrying them
                    // cannot change the outcome.
                    Err(e) if e.is_wait() => return Err(e),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(
                        e @ (Error::GuardrailFailure(_)
                        | Error::HookFailure { .. }
                        | Error::Validation(_)
                        | Error::DuplicateStepKey(_)
                        | Error::StepExecution { .. }),
                    ) => return Err(e),
                    Err(e) => {
                        if attempt >= opts.max_retries {
                            let message = e.to_string();
                            tracing::warn!(step_key = %key, error = %message, "step failed terminally");
                            self.report(key, None, Some(message.clone())).await?;
                            return Err(Error::step_execution(key, message));
                        }
                        let delay = opts
                            .base_delay
                            .saturating_mul(2u32.saturating_pow(attempt))
                            .min(opts.max_delay);
                        tracing::debug!(
                            step_key = %key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    // ── invoke family ────────────────────────────────────────────────

    fn invoke_request(
        &self,
        workflow_id: &str,
        payload: Value,
        step_key: &str,
        opts: &InvokeOptions,
    ) -> InvokeExecutionRequest {
        let ctx = self.ctx();
        InvokeExecutionRequest {
            workflow_id: workflow_id.to_owned(),
            payload,
            parent_execution_id: ctx.execution_id.clone(),
            root_execution_id: ctx.root_execution_id.clone(),
            root_workflow_id: ctx.root_workflow_id.clone(),
            deployment_id: ctx.deployment_id.clone(),
            step_key: step_key.to_owned(),
            session_id: opts.session_id.clone().or_else(|| ctx.session_id.clone()),
            user_id: opts.user_id.clone().or_else(|| ctx.user_id.clone()),
            queue: opts.queue.clone(),
        }
    }

    /// Fire-and-forget sub-workflow invocation. The handle's execution id
    /// is cached after the first call.
    pub async fn invoke(
        &self,
        key: &str,
        workflow_id: &str,
        payload: Value,
        opts: InvokeOptions,
    ) -> Result<InvokeHandle> {
        self.check_cancelled()?;
        let execution_id = match self.inner.store.claim(key, StepKind::Invoke)? {
            Claim::Cached(value) => value
                .get("executionId")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| Error::Other(format!("corrupt invoke cache for '{key}'")))?,
            Claim::Fresh => {
                let req = self.invoke_request(workflow_id, payload, key, &opts);
                let resp = self.inner.client.invoke_execution(req).await?;
                self.commit_and_report(key, json!({ "executionId": resp.execution_id }))
                    .await?;
                resp.execution_id
            }
        };
        Ok(InvokeHandle {
            execution_id,
            client: self.inner.client.clone(),
        })
    }

    /// Invoke a sub-workflow and suspend until its result is recorded.
    ///
    /// The first attempt instructs the orchestrator (deduplicated by step
    /// key) and suspends; on replay the step is cached and returns
    /// immediately. This is how concurrency without threads works:
    /// suspension = return.
    pub async fn invoke_and_wait(
        &self,
        key: &str,
        workflow_id: &str,
        payload: Value,
        opts: InvokeOptions,
    ) -> Result<Value> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Invoke)? {
            return unwrap_sub_result(value);
        }

        let req = self.invoke_request(workflow_id, payload, key, &opts);
        let resp = self.inner.client.invoke_execution(req).await?;
        Err(Error::Wait(WaitPending {
            step_key: key.to_owned(),
            reason: WaitReason::SubExecutions {
                execution_ids: vec![resp.execution_id],
            },
        }))
    }

    /// Batch fire-and-forget invocation. Child keys derive as `{key}:{i}`.
    pub async fn batch_invoke(
        &self,
        key: &str,
        entries: Vec<(String, Value)>,
        opts: InvokeOptions,
    ) -> Result<Vec<InvokeHandle>> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Invoke)? {
            let ids: Vec<String> =
                serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()))?;
            return Ok(ids
                .into_iter()
                .map(|execution_id| InvokeHandle {
                    execution_id,
                    client: self.inner.client.clone(),
                })
                .collect());
        }

        let mut ids = Vec::with_capacity(entries.len());
        for (i, (workflow_id, payload)) in entries.into_iter().enumerate() {
            let child_key = format!("{key}:{i}");
            let execution_id = match self.inner.store.get(&child_key) {
                Some(value) => value
                    .get("executionId")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        Error::Other(format!("corrupt invoke cache for '{child_key}'"))
                    })?,
                None => {
                    let req = self.invoke_request(&workflow_id, payload, &child_key, &opts);
                    let resp = self.inner.client.invoke_execution(req).await?;
                    self.commit_and_report(
                        &child_key,
                        json!({ "executionId": resp.execution_id }),
                    )
                    .await?;
                    resp.execution_id
                }
            };
            ids.push(execution_id);
        }

        self.commit_and_report(key, json!(ids)).await?;
        Ok(ids
            .into_iter()
            .map(|execution_id| InvokeHandle {
                execution_id,
                client: self.inner.client.clone(),
            })
            .collect())
    }

    /// Batch invoke-and-wait over a list of `(workflow_id, payload)`.
    ///
    /// Children whose results are already recorded are collected; missing
    /// ones are invoked (deduplicated by `{key}:{i}`) and the step suspends
    /// on them. Failed children surface as `{"__error": message}` values
    /// so callers can react per-entry.
    pub async fn batch_invoke_and_wait(
        &self,
        key: &str,
        entries: Vec<(String, Value)>,
        opts: InvokeOptions,
    ) -> Result<Vec<Value>> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Invoke)? {
            return serde_json::from_value(value).map_err(|e| Error::Other(e.to_string()));
        }

        let total = entries.len();
        let mut results: Vec<Option<Value>> = vec![None; total];
        let mut pending: Vec<String> = Vec::new();

        for (i, (workflow_id, payload)) in entries.into_iter().enumerate() {
            let child_key = format!("{key}:{i}");
            match self.inner.store.get(&child_key) {
                Some(value) => results[i] = Some(value),
                None => {
                    let req = self.invoke_request(&workflow_id, payload, &child_key, &opts);
                    let resp = self.inner.client.invoke_execution(req).await?;
                    pending.push(resp.execution_id);
                }
            }
        }

        if !pending.is_empty() {
            return Err(Error::Wait(WaitPending {
                step_key: key.to_owned(),
                reason: WaitReason::SubExecutions {
                    execution_ids: pending,
                },
            }));
        }

        let values: Vec<Value> = results.into_iter().flatten().collect();
        self.commit_and_report(key, json!(values)).await?;
        Ok(values)
    }

    // ── waits ────────────────────────────────────────────────────────

    /// Register a timer and suspend until it fires.
    pub async fn wait_for(&self, key: &str, duration: WaitDuration) -> Result<()> {
        let fire_at = Utc::now() + chrono::Duration::seconds(duration.total_seconds() as i64);
        self.wait_until(key, fire_at).await
    }

    /// Suspend until the given instant.
    pub async fn wait_until(&self, key: &str, fire_at: DateTime<Utc>) -> Result<()> {
        self.check_cancelled()?;
        if let Claim::Cached(_) = self.inner.store.claim(key, StepKind::Wait)? {
            return Ok(());
        }
        self.inner
            .client
            .register_timer(
                &self.ctx().execution_id,
                RegisterTimerRequest {
                    step_key: key.to_owned(),
                    fire_at,
                },
            )
            .await?;
        Err(Error::Wait(WaitPending {
            step_key: key.to_owned(),
            reason: WaitReason::Timer { fire_at },
        }))
    }

    /// Suspend until an event is published on `topic`, or until `timeout`
    /// elapses (which raises `EventTimeout` on replay).
    pub async fn wait_for_event(
        &self,
        key: &str,
        topic: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Event)? {
            if value
                .get(EVENT_TIMEOUT_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                return Err(Error::EventTimeout {
                    topic: topic.to_owned(),
                });
            }
            return Ok(value);
        }

        let timeout_at = timeout.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
        self.inner
            .client
            .subscribe_event(
                &self.ctx().execution_id,
                SubscribeEventRequest {
                    topic: topic.to_owned(),
                    step_key: key.to_owned(),
                    event_type: None,
                    timeout_at,
                },
            )
            .await?;
        Err(Error::Wait(WaitPending {
            step_key: key.to_owned(),
            reason: WaitReason::Event {
                topic: topic.to_owned(),
                timeout_at,
            },
        }))
    }

    // ── events ───────────────────────────────────────────────────────

    /// Fire-and-forget event publication on an arbitrary topic. Completes
    /// in-task; not memoised.
    pub async fn publish_event(
        &self,
        topic: &str,
        event_type: Option<&str>,
        data: Value,
    ) -> Result<()> {
        let ctx = self.ctx();
        self.inner
            .client
            .publish_events(PublishEventsRequest {
                topic: topic.to_owned(),
                events: vec![EventEnvelope {
                    event_type: event_type.unwrap_or("message").to_owned(),
                    data,
                }],
                execution_id: ctx.execution_id.clone(),
                root_execution_id: Some(ctx.root_execution_id.clone()),
            })
            .await
    }

    /// Publish on the execution's canonical topic.
    pub async fn publish_workflow_event(
        &self,
        event_type: Option<&str>,
        data: Value,
    ) -> Result<()> {
        let topic = self.ctx().topic();
        self.publish_event(&topic, event_type, data).await
    }

    // ── suspend / resume ─────────────────────────────────────────────

    /// Emit a suspend event (typically carrying a `_form` payload) and
    /// wait for the matching `resume_{key}` event on this execution's
    /// topic. Returns the resume payload.
    pub async fn suspend(
        &self,
        key: &str,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.check_cancelled()?;
        let topic = self.ctx().topic();

        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Suspend)? {
            if value
                .get(EVENT_TIMEOUT_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                return Err(Error::EventTimeout { topic });
            }
            return Ok(value);
        }

        self.publish_event(
            &topic,
            Some(&suspend_event_type(key)),
            data.unwrap_or_else(|| json!({})),
        )
        .await?;

        let timeout_at = timeout.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
        self.inner
            .client
            .subscribe_event(
                &self.ctx().execution_id,
                SubscribeEventRequest {
                    topic: topic.clone(),
                    step_key: key.to_owned(),
                    event_type: Some(resume_event_type(key)),
                    timeout_at,
                },
            )
            .await?;

        Err(Error::Wait(WaitPending {
            step_key: key.to_owned(),
            reason: WaitReason::Event { topic, timeout_at },
        }))
    }

    /// Publish the resume event that unblocks some other suspended
    /// execution. Memoised so replay never double-publishes.
    pub async fn resume(&self, key: &str, target: ResumeTarget) -> Result<()> {
        let topic = workflow_topic(&target.suspend_workflow_id, &target.suspend_execution_id);
        let event_type = resume_event_type(&target.suspend_step_key);
        let data = target.data.clone();
        self.run(
            key,
            || {
                let topic = topic.clone();
                let event_type = event_type.clone();
                let data = data.clone();
                async move {
                    self.publish_event(&topic, Some(&event_type), data).await?;
                    Ok(json!(true))
                }
            },
            RunOptions::default(),
        )
        .await?;
        Ok(())
    }

    // ── deterministic generators ─────────────────────────────────────

    /// A v4 UUID, memoised under `key` — the same value on every replay.
    pub async fn uuid(&self, key: &str) -> Result<String> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Generator)? {
            return value
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::Other(format!("corrupt uuid cache for '{key}'")));
        }
        let value = Uuid::new_v4().to_string();
        self.commit_and_report(key, json!(value)).await?;
        Ok(value)
    }

    /// The current instant, memoised under `key`.
    pub async fn now(&self, key: &str) -> Result<DateTime<Utc>> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Generator)? {
            let text = value
                .as_str()
                .ok_or_else(|| Error::Other(format!("corrupt now cache for '{key}'")))?;
            return DateTime::parse_from_rfc3339(text)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| Error::Other(format!("corrupt now cache for '{key}': {e}")));
        }
        let now = Utc::now();
        self.commit_and_report(key, json!(now.to_rfc3339())).await?;
        Ok(now)
    }

    /// A uniform random value in `[0, 1)`, memoised under `key`.
    pub async fn random(&self, key: &str) -> Result<f64> {
        self.check_cancelled()?;
        if let Claim::Cached(value) = self.inner.store.claim(key, StepKind::Generator)? {
            return value
                .as_f64()
                .ok_or_else(|| Error::Other(format!("corrupt random cache for '{key}'")));
        }
        let value: f64 = rand::thread_rng().gen();
        self.commit_and_report(key, json!(value)).await?;
        Ok(value)
    }

    // ── trace ────────────────────────────────────────────────────────

    /// Open a custom tracing span around `f`. Nothing is persisted.
    pub async fn trace<F, Fut, T>(&self, name: &str, f: F, attributes: Option<Value>) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let span = tracing::info_span!(
            "step.trace",
            trace_name = %name,
            attributes = tracing::field::Empty,
        );
        if let Some(attrs) = attributes {
            span.record("attributes", tracing::field::display(&attrs));
        }
        f().instrument(span).await
    }
}

/// Interpret a cached sub-execution result, surfacing the error marker.
fn unwrap_sub_result(value: Value) -> Result<Value> {
    if let Some(message) = value.get(SUB_ERROR_KEY).and_then(Value::as_str) {
        return Err(Error::Other(format!("sub-workflow failed: {message}")));
    }
    Ok(value)
}

/// The textual form of a sub-execution result handed to the LLM: failed
/// children become `"Error: <msg>"`.
pub fn sub_result_to_text(value: &Value) -> String {
    if let Some(message) = value.get(SUB_ERROR_KEY).and_then(Value::as_str) {
        return format!("Error: {message}");
    }
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
