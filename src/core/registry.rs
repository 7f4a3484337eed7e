//! Handler registry.
//!
//! Maps task type names to handlers. The registry is filled before the worker
//! is built and is read-only afterwards: the worker takes ownership of it and
//! wraps every entry in the middleware chain once, at construction.
//!
//! # Examples
//!
//! ```rust
//! use taskrelay::core::registry::HandlerRegistry;
//! use taskrelay::tasks::HealthCheckHandler;
//! use taskrelay::task::TaskType;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(TaskType::HealthCheck, HealthCheckHandler);
//! assert!(registry.contains("system:health_check"));
//! ```

use crate::middleware::{MiddlewareChain, NotFoundHandler, TaskHandler};
use std::collections::HashMap;
use std::sync::Arc;

/// Mapping from task type name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    not_found: Option<Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, replacing any previous handler.
    pub fn register<H>(&mut self, task_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        if self
            .handlers
            .insert(task_type.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "Replaced previously registered handler");
        } else {
            tracing::debug!(task_type = %task_type, "Registered task handler");
        }
        self
    }

    /// Handler for `task_type`.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Handler for `task_type`, or the wrapped not-found handler of a
    /// registry built by [`HandlerRegistry::wrapped`].
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.get(task_type).or_else(|| self.not_found.clone())
    }

    /// Whether `task_type` has a handler.
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered type names, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Copy of this registry with every handler wrapped in `chain`.
    ///
    /// Unknown task types resolve to [`NotFoundHandler`] behind the same chain.
    pub fn wrapped(&self, chain: &MiddlewareChain) -> Self {
        Self {
            handlers: self
                .handlers
                .iter()
                .map(|(task_type, handler)| (task_type.clone(), chain.wrap(Arc::clone(handler))))
                .collect(),
            not_found: Some(chain.wrap(NotFoundHandler)),
        }
    }
}
