//! BoxExecutor -- object-safe dynamic dispatch wrapper for `Executor`.
//!
//! 1. `ExecutorDyn` mirrors `Executor` with boxed futures.
//! 2. Blanket-impl `ExecutorDyn` for all `T: Executor`.
//! 3. `BoxExecutor` wraps `Arc<dyn ExecutorDyn>` and delegates, so a single
//!    executor can be shared by concurrently running steps.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use conductor_types::error::ExecutorError;
use conductor_types::task::{Task, TaskOutput};

use super::contract::{BatchItem, Executor};
use crate::context::ContextView;

type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Executor`] with boxed futures.
pub trait ExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        task: &'a Task,
        ctx: &'a ContextView,
    ) -> ExecFuture<'a, Result<TaskOutput, ExecutorError>>;

    fn execute_batch_boxed<'a>(
        &'a self,
        items: &'a [BatchItem],
    ) -> ExecFuture<'a, Vec<Result<TaskOutput, ExecutorError>>>;

    fn normalize_input(&self, input: &Value) -> Value;

    fn cache_ttl(&self) -> Option<Duration>;
}

impl<T: Executor> ExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        task: &'a Task,
        ctx: &'a ContextView,
    ) -> ExecFuture<'a, Result<TaskOutput, ExecutorError>> {
        Box::pin(self.execute(task, ctx))
    }

    fn execute_batch_boxed<'a>(
        &'a self,
        items: &'a [BatchItem],
    ) -> ExecFuture<'a, Vec<Result<TaskOutput, ExecutorError>>> {
        Box::pin(self.execute_batch(items))
    }

    fn normalize_input(&self, input: &Value) -> Value {
        Executor::normalize_input(self, input)
    }

    fn cache_ttl(&self) -> Option<Duration> {
        Executor::cache_ttl(self)
    }
}

/// Type-erased, cheaply cloneable executor handle.
#[derive(Clone)]
pub struct BoxExecutor {
    inner: Arc<dyn ExecutorDyn>,
}

impl BoxExecutor {
    pub fn new<T: Executor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn execute(&self, task: &Task, ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
        self.inner.execute_boxed(task, ctx).await
    }

    pub async fn execute_batch(&self, items: &[BatchItem]) -> Vec<Result<TaskOutput, ExecutorError>> {
        self.inner.execute_batch_boxed(items).await
    }

    pub fn normalize_input(&self, input: &Value) -> Value {
        self.inner.normalize_input(input)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.inner.cache_ttl()
    }
}

impl std::fmt::Debug for BoxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxExecutor").finish_non_exhaustive()
    }
}
