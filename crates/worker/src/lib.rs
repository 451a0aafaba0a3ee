//! `polos-worker` — End-to-end worker lifecycle.
//!
//! A worker registers itself and its definitions with the orchestrator,
//! opens an inbound push endpoint, heartbeats, dispatches executions into
//! the runtime under a concurrency cap, and reports every terminal
//! outcome. Shutdown aborts active executions cooperatively and drains
//! them with a bounded grace period.
//!
//! ```text
//! orchestrator ──POST /work──▶ WorkerServer ──▶ Worker::dispatch
//!                                                  │ concurrency cap,
//!                                                  │ per-execution abort +
//!                                                  │ timeout
//!                                                  ▼
//!                                              Executor::execute
//!                                                  │ OK / WAIT / CANCEL / FAIL
//!                                                  ▼
//!                               complete / fail / confirm (409 = discard)
//! ```

pub mod otel;
pub mod server;
pub mod worker;

pub use server::{InboundHandler, WorkerServer};
pub use worker::{Worker, WorkerState};
