//! Task registry mapping task names to async callbacks.
//!
//! Workers resolve a job's `task` field through the registry handed to
//! them at construction; there is no process-wide singleton. Payloads stay
//! opaque JSON: the engine invokes a callback one or more times with the
//! same payload over the job's lifetime, so callbacks must tolerate
//! repeats.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;

/// Type alias for the boxed async task callback.
pub type BoxedTask = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registry that maps task name strings to callbacks.
///
/// # Example
///
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register("task.echo", |payload| async move {
///     tracing::info!(%payload, "echo");
///     Ok(())
/// });
/// let registry = Arc::new(registry);
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, BoxedTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task callback under `name`.
    ///
    /// An error returned by the callback counts as a failed attempt; the
    /// worker retries it while the job's budget allows.
    pub fn register<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks
            .insert(name, Box::new(move |payload| Box::pin(task(payload))));
    }

    /// Look up the callback for `name`.
    pub fn task(&self, name: &str) -> Option<&BoxedTask> {
        self.tasks.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn registered_tasks(&self) -> Vec<&'static str> {
        self.tasks.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedTaskRegistry = Arc<TaskRegistry>;
