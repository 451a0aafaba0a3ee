//! Process-wide map of workflow id → definition.
//!
//! Definitions register during worker startup; reads afterwards are
//! lock-cheap and shared. A global registry supports definition-time
//! auto-registration; the worker also accepts an explicit registry so
//! tests never touch process state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use polos_domain::error::{Error, Result};

use crate::definition::WorkflowDefinition;

pub struct Registry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Register a definition. Fails with `DuplicateWorkflow` when the id
    /// is already taken.
    pub fn register(&self, def: Arc<WorkflowDefinition>) -> Result<()> {
        let mut map = self.workflows.write();
        if map.contains_key(&def.id) {
            return Err(Error::DuplicateWorkflow(def.id.clone()));
        }
        tracing::debug!(workflow_id = %def.id, kind = def.kind.as_str(), "registered workflow");
        map.insert(def.id.clone(), def);
        Ok(())
    }

    /// Register, replacing any existing definition with the same id.
    pub fn register_or_replace(&self, def: Arc<WorkflowDefinition>) {
        self.workflows.write().insert(def.id.clone(), def);
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.workflows.read().contains_key(id)
    }

    /// All registered ids (sorted).
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All registered definitions.
    pub fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Registry = Registry::new();
}

/// The process-wide registry used by definition-time auto-registration.
pub fn global_registry() -> &'static Registry {
    &GLOBAL
}
