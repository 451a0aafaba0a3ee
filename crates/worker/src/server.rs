//! Inbound push endpoint.
//!
//! The orchestrator delivers work with `POST /work` and aborts it with
//! `POST /cancel`; both answer `{accepted: bool}`. The server is a thin
//! axum shell — admission control and execution live in the
//! [`InboundHandler`] (the worker).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use polos_domain::error::{Error, Result};
use polos_protocol::{Accepted, CancelWorkRequest, WorkRequest};

/// What the server delegates inbound messages to.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Admit and start one execution attempt. `false` refuses the work
    /// (the orchestrator will reschedule it).
    async fn dispatch(&self, work: WorkRequest) -> bool;

    /// Request cooperative cancellation of a running execution.
    async fn cancel(&self, req: CancelWorkRequest) -> bool;
}

/// Build the inbound router.
pub fn router(handler: Arc<dyn InboundHandler>) -> Router {
    Router::new()
        .route("/work", post(work))
        .route("/cancel", post(cancel))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn work(
    State(handler): State<Arc<dyn InboundHandler>>,
    Json(req): Json<WorkRequest>,
) -> Json<Accepted> {
    tracing::debug!(
        execution_id = %req.execution_id,
        workflow_id = %req.workflow_id,
        "inbound work"
    );
    Json(Accepted {
        accepted: handler.dispatch(req).await,
    })
}

async fn cancel(
    State(handler): State<Arc<dyn InboundHandler>>,
    Json(req): Json<CancelWorkRequest>,
) -> Json<Accepted> {
    tracing::debug!(execution_id = %req.execution_id, "inbound cancel");
    Json(Accepted {
        accepted: handler.cancel(req).await,
    })
}

/// A running inbound server.
pub struct WorkerServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerServer {
    /// Bind `bind_addr` (e.g. `127.0.0.1:3710`) and serve until stopped.
    pub async fn start(bind_addr: &str, handler: Arc<dyn InboundHandler>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {bind_addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Config(e.to_string()))?;

        let app = router(handler);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "inbound server exited");
            }
        });

        tracing::info!(%addr, "inbound server listening");
        Ok(Self { addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
