//! Worker lifecycle: registration, heartbeating, dispatch, shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use polos_client::{OrchestratorApi, RestOrchestratorClient};
use polos_domain::config::{ConfigSeverity, WorkerConfig};
use polos_domain::error::{Error, Result};
use polos_protocol::{
    CancelWorkRequest, CompleteExecutionRequest, FailExecutionRequest, QueueEntry,
    RegisterAgentRequest, RegisterDeploymentRequest, RegisterQueuesRequest, RegisterToolRequest,
    RegisterWorkerRequest, RegisterWorkflowRequest, WorkRequest, WorkerCapabilities,
};
use polos_runtime::{
    global_registry, ExecutionOutcome, Executor, Registry, Trigger, WorkflowKind,
};

use crate::otel;
use crate::server::{InboundHandler, WorkerServer};

/// How long shutdown waits for active executions to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ActiveExecution {
    cancel: CancellationToken,
    /// Cancelled when the execution finishes, disarming its timeout timer.
    done: CancellationToken,
}

struct WorkerInner {
    config: WorkerConfig,
    client: Arc<dyn OrchestratorApi>,
    registry: Arc<Registry>,
    executor: Executor,
    state: Mutex<WorkerState>,
    worker_id: Mutex<Option<String>>,
    active: Mutex<HashMap<String, ActiveExecution>>,
    shutdown: CancellationToken,
    server: Mutex<Option<WorkerServer>>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A push-mode worker bound to one deployment.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Build a worker over the production REST client and its own
    /// registry (falling back to the global registry at dispatch).
    pub fn new(config: WorkerConfig, registry: Arc<Registry>) -> Result<Self> {
        let client: Arc<dyn OrchestratorApi> =
            Arc::new(RestOrchestratorClient::from_config(&config)?);
        Ok(Self::with_client(config, registry, client))
    }

    /// Build a worker over any [`OrchestratorApi`] (tests inject fakes).
    pub fn with_client(
        config: WorkerConfig,
        registry: Arc<Registry>,
        client: Arc<dyn OrchestratorApi>,
    ) -> Self {
        let executor = Executor::new(client.clone(), registry.clone(), config.agent_max_steps);
        Self {
            inner: Arc::new(WorkerInner {
                config,
                client,
                registry,
                executor,
                state: Mutex::new(WorkerState::Stopped),
                worker_id: Mutex::new(None),
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                server: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.lock()
    }

    pub fn worker_id(&self) -> Option<String> {
        self.inner.worker_id.lock().clone()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != from {
            return Err(Error::Other(format!(
                "illegal worker transition: {} → {to} (expected {from})",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    // ── Startup ──────────────────────────────────────────────────────

    /// Run the full startup sequence and transition to `running`.
    pub async fn start(&self) -> Result<()> {
        self.transition(WorkerState::Stopped, WorkerState::Starting)?;
        if let Err(e) = self.start_inner().await {
            *self.inner.state.lock() = WorkerState::Stopped;
            return Err(e);
        }
        self.transition(WorkerState::Starting, WorkerState::Running)?;
        tracing::info!(
            deployment_id = %self.inner.config.deployment_id,
            worker_id = ?self.worker_id(),
            "worker running"
        );
        Ok(())
    }

    async fn start_inner(&self) -> Result<()> {
        let config = &self.inner.config;

        let issues = config.validate();
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                ConfigSeverity::Error => tracing::error!("config: {issue}"),
            }
        }
        if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
            return Err(Error::Config("configuration validation failed".into()));
        }

        // 1. Telemetry (non-fatal).
        if let Err(e) = otel::init(config) {
            tracing::warn!(error = %e, "otel init failed, continuing without export");
        }

        // 2–6. Registration sequence.
        self.register_all().await?;

        // 7. Inbound server.
        let bind_addr = format!("{}:{}", config.bind_host(), config.server.port);
        let server = WorkerServer::start(&bind_addr, Arc::new(self.clone())).await?;
        *self.inner.server.lock() = Some(server);

        // 8. Heartbeat.
        self.spawn_heartbeat();

        // 9. Signal handlers.
        self.spawn_signal_handler();

        Ok(())
    }

    /// Steps 2–6: register the worker, deployment, definitions, queues,
    /// and mark online. Re-run in full when a heartbeat demands it.
    async fn register_all(&self) -> Result<()> {
        let config = &self.inner.config;
        let definitions = self.inner.registry.definitions();

        let mut agent_ids = Vec::new();
        let mut tool_ids = Vec::new();
        let mut workflow_ids = Vec::new();
        for def in &definitions {
            match def.kind {
                WorkflowKind::Agent => agent_ids.push(def.id.clone()),
                WorkflowKind::Tool => tool_ids.push(def.id.clone()),
                WorkflowKind::Workflow => workflow_ids.push(def.id.clone()),
            }
        }
        agent_ids.sort();
        tool_ids.sort();
        workflow_ids.sort();

        // 2. Worker registration → worker id.
        let registered = self
            .inner
            .client
            .register_worker(RegisterWorkerRequest {
                deployment_id: config.deployment_id.clone(),
                project_id: config.project_id.clone(),
                mode: "push".into(),
                capabilities: WorkerCapabilities {
                    runtime: "rust".into(),
                    agent_ids: agent_ids.clone(),
                    tool_ids: tool_ids.clone(),
                    workflow_ids: workflow_ids.clone(),
                },
                max_concurrent_executions: config.max_concurrent_workflows,
                push_endpoint_url: config.effective_push_endpoint(),
            })
            .await?;
        *self.inner.worker_id.lock() = Some(registered.worker_id.clone());
        tracing::info!(worker_id = %registered.worker_id, "worker registered");

        // 3. Deployment.
        self.inner
            .client
            .register_deployment(RegisterDeploymentRequest {
                deployment_id: config.deployment_id.clone(),
            })
            .await?;

        // 4. Agents, tools, workflow entries.
        for def in &definitions {
            match (&def.kind, &def.agent, &def.tool) {
                (WorkflowKind::Agent, Some(agent), _) => {
                    self.inner
                        .client
                        .register_agent(RegisterAgentRequest {
                            id: def.id.clone(),
                            deployment_id: config.deployment_id.clone(),
                            provider: agent.provider.clone(),
                            model: agent.llm.model().to_owned(),
                            system_prompt: agent.system_prompt.clone(),
                            tools: (!agent.tools.is_empty()).then(|| agent.tools.clone()),
                            temperature: agent.temperature,
                            max_output_tokens: agent.max_output_tokens,
                            metadata: None,
                        })
                        .await?;
                }
                (WorkflowKind::Tool, _, Some(tool)) => {
                    self.inner
                        .client
                        .register_tool(RegisterToolRequest {
                            id: def.id.clone(),
                            deployment_id: config.deployment_id.clone(),
                            tool_type: "workflow".into(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                            metadata: None,
                        })
                        .await?;
                }
                _ => {}
            }

            self.inner
                .client
                .register_workflow(
                    &config.deployment_id,
                    RegisterWorkflowRequest {
                        workflow_id: def.id.clone(),
                        workflow_type: def.kind.as_str().to_owned(),
                        trigger_on_event: match &def.trigger {
                            Some(Trigger::Event(topic)) => Some(topic.clone()),
                            _ => None,
                        },
                        scheduled: matches!(def.trigger, Some(Trigger::Cron(_))).then_some(true),
                    },
                )
                .await?;
        }

        // 5. Queues (non-fatal). Collect min(concurrency limit) per queue
        // name, omitting scheduled workflows.
        let mut queues: HashMap<String, Option<usize>> = HashMap::new();
        for def in &definitions {
            if matches!(def.trigger, Some(Trigger::Cron(_))) {
                continue;
            }
            let Some(binding) = &def.queue else { continue };
            queues
                .entry(binding.name.clone())
                .and_modify(|limit| {
                    *limit = match (*limit, binding.concurrency_limit) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (None, b) => b,
                        (a, None) => a,
                    }
                })
                .or_insert(binding.concurrency_limit);
        }
        if !queues.is_empty() {
            let mut entries: Vec<QueueEntry> = queues
                .into_iter()
                .map(|(name, concurrency_limit)| QueueEntry {
                    name,
                    concurrency_limit,
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            if let Err(e) = self
                .inner
                .client
                .register_queues(RegisterQueuesRequest {
                    deployment_id: config.deployment_id.clone(),
                    queues: entries,
                })
                .await
            {
                tracing::warn!(error = %e, "queue registration failed");
            }
        }

        // 6. Online marker (non-fatal).
        if let Err(e) = self.inner.client.mark_online(&registered.worker_id).await {
            tracing::warn!(error = %e, "mark online failed");
        }

        Ok(())
    }

    fn spawn_heartbeat(&self) {
        let worker = self.clone();
        let period = Duration::from_secs(self.inner.config.heartbeat_interval_secs);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = worker.inner.shutdown.cancelled() => return,
                }
                let Some(worker_id) = worker.worker_id() else { continue };
                match worker.inner.client.heartbeat(&worker_id).await {
                    Ok(resp) if resp.re_register => {
                        tracing::info!("orchestrator requested re-registration");
                        if let Err(e) = worker.register_all().await {
                            tracing::error!(error = %e, "re-registration failed");
                        }
                    }
                    Ok(_) => tracing::trace!("heartbeat ok"),
                    Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
                }
            }
        });
        *self.inner.heartbeat.lock() = Some(handle);
    }

    fn spawn_signal_handler(&self) {
        let worker = self.clone();
        tokio::spawn(async move {
            let terminated = async {
                #[cfg(unix)]
                {
                    let mut sigterm = match tokio::signal::unix::signal(
                        tokio::signal::unix::SignalKind::terminate(),
                    ) {
                        Ok(s) => s,
                        Err(_) => return std::future::pending::<()>().await,
                    };
                    sigterm.recv().await;
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminated => {}
                _ = worker.inner.shutdown.cancelled() => return,
            }
            tracing::info!("shutdown signal received");
            if let Err(e) = worker.shutdown().await {
                tracing::error!(error = %e, "shutdown failed");
            }
        });
    }

    /// Park until shutdown completes.
    pub async fn run(&self) {
        self.inner.shutdown.cancelled().await;
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    async fn dispatch_inner(&self, work: WorkRequest) -> bool {
        if self.state() != WorkerState::Running {
            tracing::warn!(
                execution_id = %work.execution_id,
                state = %self.state(),
                "refusing work, worker not running"
            );
            return false;
        }

        // Resolve: local registry → global registry → refuse.
        let def = match self
            .inner
            .registry
            .get(&work.workflow_id)
            .or_else(|| global_registry().get(&work.workflow_id))
        {
            Some(def) => def,
            None => {
                tracing::warn!(workflow_id = %work.workflow_id, "unknown workflow, refusing");
                return false;
            }
        };

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        {
            let mut active = self.inner.active.lock();
            if active.len() >= self.inner.config.max_concurrent_workflows {
                tracing::warn!(
                    execution_id = %work.execution_id,
                    active = active.len(),
                    "concurrency limit reached, refusing work"
                );
                return false;
            }
            // Re-entry protection: one attempt per execution at a time.
            if active.contains_key(&work.execution_id) {
                tracing::warn!(
                    execution_id = %work.execution_id,
                    "execution already active on this worker, refusing"
                );
                return false;
            }
            active.insert(
                work.execution_id.clone(),
                ActiveExecution {
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
        }

        // Per-execution timeout arms the same abort token.
        if let Some(timeout_secs) = work.run_timeout_seconds {
            let cancel = cancel.clone();
            let done = done.clone();
            let execution_id = work.execution_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                        tracing::warn!(%execution_id, timeout_secs, "execution timed out");
                        cancel.cancel();
                    }
                    _ = done.cancelled() => {}
                }
            });
        }

        let worker = self.clone();
        tokio::spawn(async move {
            let worker_id = worker.worker_id().unwrap_or_default();
            let outcome = worker
                .inner
                .executor
                .execute(def, &work, cancel, &worker_id)
                .await;
            worker.report_outcome(&work, outcome, &worker_id).await;
            done.cancel();
            worker.inner.active.lock().remove(&work.execution_id);
        });

        true
    }

    async fn report_outcome(&self, work: &WorkRequest, outcome: ExecutionOutcome, worker_id: &str) {
        match outcome {
            ExecutionOutcome::Completed {
                result,
                final_state,
            } => {
                if let Err(e) = self
                    .inner
                    .client
                    .complete_execution(
                        &work.execution_id,
                        CompleteExecutionRequest {
                            result,
                            worker_id: worker_id.to_owned(),
                            final_state,
                        },
                    )
                    .await
                {
                    tracing::error!(
                        execution_id = %work.execution_id,
                        error = %e,
                        "completion report failed"
                    );
                }
            }
            ExecutionOutcome::Failed { error, retryable } => {
                tracing::warn!(
                    execution_id = %work.execution_id,
                    retryable,
                    error = %error,
                    "execution failed"
                );
                if let Err(e) = self
                    .inner
                    .client
                    .fail_execution(
                        &work.execution_id,
                        FailExecutionRequest {
                            error,
                            worker_id: worker_id.to_owned(),
                            stack: None,
                            retryable,
                            final_state: None,
                        },
                    )
                    .await
                {
                    tracing::error!(
                        execution_id = %work.execution_id,
                        error = %e,
                        "failure report failed"
                    );
                }
            }
            // The executor already confirmed the cancel; WAIT reports
            // nothing — the task just ends.
            ExecutionOutcome::Cancelled => {
                tracing::info!(execution_id = %work.execution_id, "execution cancelled");
            }
            ExecutionOutcome::Waiting => {
                tracing::debug!(execution_id = %work.execution_id, "execution suspended");
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop heartbeating, abort active executions, drain with a grace
    /// period, and stop the inbound server.
    pub async fn shutdown(&self) -> Result<()> {
        self.transition(WorkerState::Running, WorkerState::Stopping)?;
        tracing::info!(active = self.active_count(), "worker stopping");

        if let Some(handle) = self.inner.heartbeat.lock().take() {
            handle.abort();
        }

        for (execution_id, active) in self.inner.active.lock().iter() {
            tracing::debug!(%execution_id, "aborting active execution");
            active.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.active_count() > 0 {
            tracing::warn!(
                remaining = self.active_count(),
                "shutdown grace expired with executions still active"
            );
        }

        if let Some(server) = self.inner.server.lock().take() {
            server.stop();
        }
        self.inner.shutdown.cancel();
        self.transition(WorkerState::Stopping, WorkerState::Stopped)?;
        tracing::info!("worker stopped");
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for Worker {
    async fn dispatch(&self, work: WorkRequest) -> bool {
        self.dispatch_inner(work).await
    }

    async fn cancel(&self, req: CancelWorkRequest) -> bool {
        let token = self
            .inner
            .active
            .lock()
            .get(&req.execution_id)
            .map(|a| a.cancel.clone());
        match token {
            Some(token) => {
                tracing::info!(execution_id = %req.execution_id, "cancel requested");
                token.cancel();
                true
            }
            None => false,
        }
    }
}
