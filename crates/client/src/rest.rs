//! REST implementation of [`OrchestratorApi`].
//!
//! Wraps a `reqwest::Client` and translates every trait method into the
//! corresponding HTTP call, with automatic retry + exponential back-off on
//! transient (5xx / timeout) failures. Conflict responses (409) on the
//! completion endpoints mean "execution reassigned" and are discarded
//! silently.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use polos_domain::config::WorkerConfig;
use polos_domain::error::{Error, Result};
use polos_protocol::{
    CompleteExecutionRequest, ConfirmCancellationRequest, ExecutionStatusResponse,
    FailExecutionRequest, HeartbeatResponse, InvokeExecutionRequest, InvokeExecutionResponse,
    ListStepsResponse, PublishEventsRequest, RegisterAgentRequest, RegisterDeploymentRequest,
    RegisterQueuesRequest, RegisterTimerRequest, RegisterToolRequest, RegisterWorkerRequest,
    RegisterWorkerResponse, RegisterWorkflowRequest, SessionMemory, SpanBatchRequest,
    StepReportRequest, SubscribeEventRequest,
};

use crate::api::OrchestratorApi;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A REST-based orchestrator client.
///
/// Created once at worker startup and shared across all executions. The
/// underlying `reqwest::Client` maintains a connection pool.
#[derive(Debug, Clone)]
pub struct RestOrchestratorClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl RestOrchestratorClient {
    /// Build a client from the worker config.
    pub fn from_config(cfg: &WorkerConfig) -> Result<Self> {
        Self::new(&cfg.api_url, cfg.api_key.clone())
    }

    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            max_retries: 3,
        })
    }

    /// Override the retry budget (tests dial this down).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    // ── request helpers ──────────────────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Decorate a `RequestBuilder` with the standard headers.
    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        let trace_id = Uuid::new_v4().to_string();
        let mut rb = rb
            .header("X-Client-Type", "polos-worker")
            .header("X-Trace-Id", &trace_id);
        if let Some(ref key) = self.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }

    // ── retry engine ─────────────────────────────────────────────────

    /// Execute a request with retry + exponential back-off on transient
    /// errors.
    ///
    /// * Retries on 5xx status codes and on timeouts/connection errors.
    /// * Does **not** retry on 4xx (client errors are permanent).
    async fn execute_with_retry(
        &self,
        endpoint: &str,
        build_request: impl Fn() -> RequestBuilder + Send + Sync,
    ) -> Result<Response> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let rb = self.decorate(build_request());
            match rb.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        let body = resp.text().await.unwrap_or_default();
                        tracing::warn!(
                            endpoint,
                            status = status.as_u16(),
                            attempt,
                            "orchestrator call failed, retrying"
                        );
                        last_err = Some(Error::Api {
                            status: status.as_u16(),
                            message: format!("{endpoint}: {body}"),
                        });
                        continue;
                    }
                    if status.is_client_error() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(Error::Api {
                            status: status.as_u16(),
                            message: format!("{endpoint}: {body}"),
                        });
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    last_err = Some(from_reqwest(e));
                    // Timeouts and connection errors are transient — retry.
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Http(format!("{endpoint}: all retries exhausted"))))
    }

    async fn parse_json<R: DeserializeOwned>(endpoint: &str, resp: Response) -> Result<R> {
        let body = resp.text().await.map_err(from_reqwest)?;
        serde_json::from_str(&body).map_err(|e| {
            Error::Http(format!("failed to parse {endpoint} response: {e}: {body}"))
        })
    }

    async fn post_json<B: serde::Serialize + Sync>(&self, path: &str, body: &B) -> Result<Response> {
        let url = self.url(path);
        self.execute_with_retry(path, || self.http.post(&url).json(body))
            .await
    }

    async fn post_empty(&self, path: &str) -> Result<Response> {
        let url = self.url(path);
        self.execute_with_retry(path, || self.http.post(&url)).await
    }
}

/// Map a conflict (409) to silent success: the execution was reassigned
/// and this worker's report is stale.
fn discard_conflict(result: Result<Response>, execution_id: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(Error::Api { status: 409, .. }) => {
            tracing::debug!(execution_id, "report conflicted (reassigned), discarding");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl OrchestratorApi for RestOrchestratorClient {
    async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        let resp = self.post_json("/workers/register", &req).await?;
        Self::parse_json("/workers/register", resp).await
    }

    async fn register_deployment(&self, req: RegisterDeploymentRequest) -> Result<()> {
        self.post_json("/deployments", &req).await?;
        Ok(())
    }

    async fn register_agent(&self, req: RegisterAgentRequest) -> Result<()> {
        self.post_json("/agents", &req).await?;
        Ok(())
    }

    async fn register_tool(&self, req: RegisterToolRequest) -> Result<()> {
        self.post_json("/tools", &req).await?;
        Ok(())
    }

    async fn register_workflow(
        &self,
        deployment_id: &str,
        req: RegisterWorkflowRequest,
    ) -> Result<()> {
        self.post_json(&format!("/deployments/{deployment_id}/workflows"), &req)
            .await?;
        Ok(())
    }

    async fn register_queues(&self, req: RegisterQueuesRequest) -> Result<()> {
        self.post_json("/queues", &req).await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<HeartbeatResponse> {
        let path = format!("/workers/{worker_id}/heartbeat");
        let resp = self.post_empty(&path).await?;
        Self::parse_json(&path, resp).await
    }

    async fn mark_online(&self, worker_id: &str) -> Result<()> {
        self.post_empty(&format!("/workers/{worker_id}/online"))
            .await?;
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        req: CompleteExecutionRequest,
    ) -> Result<()> {
        let result = self
            .post_json(&format!("/executions/{execution_id}/complete"), &req)
            .await;
        discard_conflict(result, execution_id)
    }

    async fn fail_execution(&self, execution_id: &str, req: FailExecutionRequest) -> Result<()> {
        let result = self
            .post_json(&format!("/executions/{execution_id}/fail"), &req)
            .await;
        discard_conflict(result, execution_id)
    }

    async fn confirm_cancellation(
        &self,
        execution_id: &str,
        req: ConfirmCancellationRequest,
    ) -> Result<()> {
        let result = self
            .post_json(&format!("/executions/{execution_id}/cancel/confirm"), &req)
            .await;
        discard_conflict(result, execution_id)
    }

    async fn report_step(&self, execution_id: &str, req: StepReportRequest) -> Result<()> {
        self.post_json(&format!("/executions/{execution_id}/steps"), &req)
            .await?;
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<ListStepsResponse> {
        let path = format!("/executions/{execution_id}/steps");
        let url = self.url(&path);
        let resp = self
            .execute_with_retry(&path, || self.http.get(&url))
            .await?;
        Self::parse_json(&path, resp).await
    }

    async fn invoke_execution(
        &self,
        req: InvokeExecutionRequest,
    ) -> Result<InvokeExecutionResponse> {
        let resp = self.post_json("/executions/invoke", &req).await?;
        Self::parse_json("/executions/invoke", resp).await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionStatusResponse> {
        let path = format!("/executions/{execution_id}");
        let url = self.url(&path);
        let resp = self
            .execute_with_retry(&path, || self.http.get(&url))
            .await?;
        Self::parse_json(&path, resp).await
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        self.post_empty(&format!("/executions/{execution_id}/cancel"))
            .await?;
        Ok(())
    }

    async fn register_timer(&self, execution_id: &str, req: RegisterTimerRequest) -> Result<()> {
        self.post_json(&format!("/executions/{execution_id}/timers"), &req)
            .await?;
        Ok(())
    }

    async fn subscribe_event(&self, execution_id: &str, req: SubscribeEventRequest) -> Result<()> {
        self.post_json(&format!("/executions/{execution_id}/subscriptions"), &req)
            .await?;
        Ok(())
    }

    async fn publish_events(&self, req: PublishEventsRequest) -> Result<()> {
        self.post_json("/events/publish", &req).await?;
        Ok(())
    }

    async fn get_session_memory(&self, session_id: &str) -> Result<SessionMemory> {
        let path = format!("/sessions/{session_id}/memory");
        let url = self.url(&path);
        let resp = self
            .execute_with_retry(&path, || self.http.get(&url))
            .await?;
        Self::parse_json(&path, resp).await
    }

    async fn put_session_memory(&self, session_id: &str, memory: &SessionMemory) -> Result<()> {
        let path = format!("/sessions/{session_id}/memory");
        let url = self.url(&path);
        self.execute_with_retry(&path, || self.http.put(&url).json(memory))
            .await?;
        Ok(())
    }

    async fn export_spans(&self, req: SpanBatchRequest) -> Result<()> {
        self.post_json("/internal/spans/batch", &req).await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error conversion helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert a `reqwest::Error` into a domain `Error`.
fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}
