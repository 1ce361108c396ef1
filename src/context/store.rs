//! Concurrent id → context map.
//!
//! Setup, run, and teardown of one test arrive as separate commands; the
//! store is how they find the same in-progress context. It holds at most
//! one context per id. A missing id is not an error here; callers decide
//! whether it is fatal.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::ExecutionContext;

#[derive(Debug, Clone, Default)]
pub struct ExecutionContextStore {
    contexts: Arc<DashMap<Uuid, Arc<ExecutionContext>>>,
}

impl ExecutionContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; returns the replaced context, if any.
    pub fn set(&self, id: Uuid, context: Arc<ExecutionContext>) -> Option<Arc<ExecutionContext>> {
        self.contexts.insert(id, context)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<ExecutionContext>> {
        self.contexts.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<ExecutionContext>> {
        self.contexts.remove(id).map(|(_, context)| context)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Removes and returns every context.
    pub fn drain(&self) -> Vec<Arc<ExecutionContext>> {
        let ids: Vec<Uuid> = self.contexts.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}
