//! Per-execution memoisation of step outcomes.
//!
//! A `StepStore` is created fresh for every attempt and hydrated from the
//! step results the orchestrator has already recorded for the execution.
//! It is logically single-writer (the executing task); the lock exists only
//! because the helper handle is cloneable.
//!
//! Key collision semantics: re-evaluating a key with the *same* operation
//! kind is a cache hit (replay). Re-using a key for a *different* operation
//! kind within one attempt is the classic reordering bug and fails with
//! `DuplicateStepKey`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use polos_domain::error::{Error, Result};
use polos_protocol::StepRecord;

/// One committed step outcome. Immutable once written.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub key: String,
    pub value: Value,
    pub completed_at: DateTime<Utc>,
}

/// The operation family a key was claimed by, used for collision detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Run,
    Invoke,
    Wait,
    Event,
    Suspend,
    Generator,
}

impl StepKind {
    fn label(&self) -> &'static str {
        match self {
            StepKind::Run => "run",
            StepKind::Invoke => "invoke",
            StepKind::Wait => "wait",
            StepKind::Event => "event",
            StepKind::Suspend => "suspend",
            StepKind::Generator => "generator",
        }
    }
}

/// Result of claiming a key for evaluation.
#[derive(Debug, Clone)]
pub enum Claim {
    /// The key has a committed outcome — return it without running anything.
    Cached(Value),
    /// First evaluation of this key in this execution.
    Fresh,
}

#[derive(Default)]
struct Inner {
    results: HashMap<String, StepResult>,
    /// Commit order, for debugging and ordering assertions.
    order: Vec<String>,
    /// Keys claimed during this attempt, with the claiming operation kind.
    claimed: HashMap<String, StepKind>,
}

/// Per-execution step cache.
pub struct StepStore {
    inner: Mutex<Inner>,
}

impl Default for StepStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StepStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed the cache from the orchestrator's recorded results.
    pub fn hydrate(&self, records: Vec<StepRecord>) {
        let mut inner = self.inner.lock();
        for record in records {
            inner.order.push(record.key.clone());
            inner.results.insert(
                record.key.clone(),
                StepResult {
                    key: record.key,
                    value: record.result,
                    completed_at: record.completed_at,
                },
            );
        }
    }

    /// Claim `key` for an operation of `kind`.
    ///
    /// Returns the cached value when the key already committed; errors when
    /// the key was claimed this attempt by a different operation kind.
    pub fn claim(&self, key: &str, kind: StepKind) -> Result<Claim> {
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.claimed.get(key) {
            if *prev != kind {
                return Err(Error::DuplicateStepKey(format!(
                    "{key} (first used by {}, now by {})",
                    prev.label(),
                    kind.label()
                )));
            }
        } else {
            inner.claimed.insert(key.to_owned(), kind);
        }

        match inner.results.get(key) {
            Some(result) => Ok(Claim::Cached(result.value.clone())),
            None => Ok(Claim::Fresh),
        }
    }

    /// Commit a step outcome. First write wins; a second commit for the
    /// same key is ignored (the value is immutable).
    pub fn commit(&self, key: &str, value: Value) -> StepResult {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.results.get(key) {
            return existing.clone();
        }
        let result = StepResult {
            key: key.to_owned(),
            value,
            completed_at: Utc::now(),
        };
        inner.order.push(key.to_owned());
        inner.results.insert(key.to_owned(), result.clone());
        result
    }

    /// Look up a committed value without claiming.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().results.get(key).map(|r| r.value.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().results.contains_key(key)
    }

    /// Keys in commit order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().results.is_empty()
    }
}
