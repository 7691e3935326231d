//! Named job handlers.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::job::{HandlerResult, JobContext};
use crate::error::{JobforgeError, Result};

/// Work performed for one job attempt.
///
/// Any `Fn(JobContext) -> impl Future<Output = HandlerResult>` closure is a handler:
///
/// ```rust
/// use jobforge_core::jobs::{HandlerRegistry, JobContext};
///
/// let registry = HandlerRegistry::new();
/// registry.register("echo", |ctx: JobContext| async move { Ok(ctx.into_payload()) });
/// assert!(registry.contains("echo"));
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run one attempt.
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Maps job names to handlers.
///
/// Lookups happen at dispatch time, so a handler registered after a job was
/// enqueued still serves it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration under the same name replaces it.
    pub fn register<H: JobHandler>(&self, name: impl Into<String>, handler: H) {
        self.register_arc(name, Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_arc(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        let replaced = self.handlers.write().insert(name.clone(), handler).is_some();
        tracing::debug!(job_name = %name, replaced, "Handler registered");
    }

    /// Find the handler for `name`.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobforgeError::handler_not_found(name))
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
