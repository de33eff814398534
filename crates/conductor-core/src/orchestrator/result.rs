//! What a run reports back to its caller.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use conductor_types::error::ErrorClass;
use conductor_types::task::Capability;
use conductor_types::workflow::{RunStatus, StepKind, StepStatus};

use crate::context::ContextStore;
use crate::error::StepError;

/// One entry of a run's error log.
#[derive(Debug, Clone, Serialize)]
pub struct StepErrorRecord {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    pub class: ErrorClass,
    /// Discriminator such as `timeout` or `circuit_open`.
    pub kind: String,
    pub message: String,
    pub attempts: u32,
    #[serde(skip)]
    pub cause: Option<StepError>,
}

impl StepErrorRecord {
    pub fn new(step_id: &str, capability: Option<&Capability>, error: &StepError, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            capability: capability.cloned(),
            class: error.class(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            attempts,
            cause: Some(error.clone()),
        }
    }
}

/// Final state of one step (or parallel member).
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    /// Enclosing parallel group, for members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub required: bool,
    pub status: StepStatus,
    pub attempts: u32,
    /// Served from the memoization cache.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub duration_ms: u64,
}

/// Result of one compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Compensated,
    /// The step declares no compensation.
    NoAction,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompensationRecord {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    #[serde(flatten)]
    pub outcome: CompensationOutcome,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub overall_status: RunStatus,
    pub final_context: ContextStore,
    /// Keyed by step ID; parallel members have their own entries.
    pub step_results: BTreeMap<String, StepResult>,
    /// Failures in topological order.
    pub error_log: Vec<StepErrorRecord>,
    /// Compensations in the order they ran.
    pub compensation_log: Vec<CompensationRecord>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.step(step_id).map(|r| r.status)
    }

    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.step(step_id).and_then(|r| r.output.as_ref())
    }

    /// Latest value of every context key.
    pub fn context(&self) -> Value {
        self.final_context.to_json()
    }

    /// Step IDs whose compensation ran successfully, in execution order.
    pub fn compensated_steps(&self) -> Vec<&str> {
        self.compensation_log
            .iter()
            .filter(|r| r.outcome == CompensationOutcome::Compensated)
            .map(|r| r.step_id.as_str())
            .collect()
    }
}
