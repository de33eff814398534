//! The `Executor` trait.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use conductor_types::error::ExecutorError;
use conductor_types::task::{Task, TaskOutput};

use crate::context::ContextView;

/// One task queued for a batched dispatch, with the context it was
/// scheduled against.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub task: Task,
    pub context: Arc<ContextView>,
}

/// A worker that performs tasks for one or more capabilities.
///
/// Executors may be invoked concurrently and must not hold per-task state
/// across calls. Context writes go through `ContextView::propose` or
/// `TaskOutput::proposals`, never directly to the run context.
pub trait Executor: Send + Sync {
    /// Perform a single task.
    fn execute(
        &self,
        task: &Task,
        ctx: &ContextView,
    ) -> impl std::future::Future<Output = Result<TaskOutput, ExecutorError>> + Send;

    /// Perform a window of tasks in one call.
    ///
    /// Must return exactly one result per item, in item order. The default
    /// runs the items one by one through `execute`.
    fn execute_batch(
        &self,
        items: &[BatchItem],
    ) -> impl std::future::Future<Output = Vec<Result<TaskOutput, ExecutorError>>> + Send {
        async move {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                results.push(self.execute(&item.task, &item.context).await);
            }
            results
        }
    }

    /// Strip volatile fields (timestamps, request ids) before fingerprinting.
    fn normalize_input(&self, input: &Value) -> Value {
        input.clone()
    }

    /// Preferred cache lifetime for results of this executor.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }
}

/// Remove `fields` from every object nested in `value`.
///
/// Helper for `Executor::normalize_input` implementations.
pub fn without_fields(value: &Value, fields: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !fields.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), without_fields(v, fields)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| without_fields(v, fields)).collect()),
        other => other.clone(),
    }
}
