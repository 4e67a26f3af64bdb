//! Task handler registry — task-type string to handler, fixed at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::tasks::TaskHandler;

/// Immutable mapping from task type to handler. Built once at
/// composition time; resolution is a plain map lookup.
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Resolve the handler for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, for logs and diagnostics.
    pub fn task_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers at startup and freezes them into a registry.
pub struct TaskRegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistryBuilder {
    /// Register a handler under its own task type. Last registration
    /// for a type wins.
    pub fn register(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        let task_type = handler.task_type().to_string();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            tracing::warn!(task_type, "Replaced existing task handler");
        } else {
            tracing::debug!(task_type, "Registered task handler");
        }
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            handlers: self.handlers,
        }
    }
}
