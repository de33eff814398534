//! Tasks, capabilities and task outputs.
//!
//! A `Task` is the immutable unit of work handed to an executor. It is built
//! by the orchestrator from a step and the context visible to that step.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A named category of work an executor can perform (e.g. "analysis").
///
/// Capabilities are the lookup key of the executor registry, the circuit
/// breaker table and the batch queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Capability {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Execution constraints attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Wall-clock limit for the owning step, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether the result may be served from / written to the cache.
    #[serde(default)]
    pub cacheable: bool,
}

/// An atomic unit of work.
///
/// Immutable once created. Retries re-dispatch the same `Task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// `{run_id}:{step_id}` -- unique within a process.
    pub id: String,
    /// Step that produced this task.
    pub step_id: String,
    /// Capability the task must be dispatched to.
    pub capability: Capability,
    /// Resolved input: `{ "params": ..., "context": { key: value } }`.
    pub input: Value,
    pub constraints: TaskConstraints,
}

impl Task {
    /// Static parameters declared on the step.
    pub fn params(&self) -> &Value {
        self.input.get("params").unwrap_or(&Value::Null)
    }

    /// A context value the step declared it reads.
    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.input.get("context").and_then(|c| c.get(key))
    }
}

// ---------------------------------------------------------------------------
// TaskOutput
// ---------------------------------------------------------------------------

/// A proposed addition to the run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub key: String,
    pub value: Value,
}

/// The successful result of executing a task.
///
/// `proposals` are never applied by the executor: the orchestrator merges
/// them into the run context once the step has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proposals: Vec<Proposal>,
}

impl TaskOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            proposals: Vec::new(),
        }
    }

    /// Builder-style helper to attach a context proposal.
    pub fn propose(mut self, key: impl Into<String>, value: Value) -> Self {
        self.proposals.push(Proposal {
            key: key.into(),
            value,
        });
        self
    }
}
