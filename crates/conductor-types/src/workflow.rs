//! Workflow domain types for Conductor.
//!
//! Defines the declarative workflow representation (`WorkflowDefinition`)
//! consumed by the graph compiler, plus the step/run status enums reported
//! back to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition (declarative input)
// ---------------------------------------------------------------------------

/// A declarative workflow description.
///
/// The on-disk format is an adapter concern (YAML in `conductor-infra`); the
/// engine only ever runs the compiled graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Maximum concurrently executing tasks for a run (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Steps forming the workflow DAG, in declaration order.
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a declarative workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow, including parallel group members.
    pub id: String,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed required step halts the run and triggers compensation.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Whether the step consults the memoization cache.
    #[serde(default)]
    pub cacheable: bool,
    /// Per-step retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Wall-clock timeout for the whole step, retries included, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Static parameters passed to the executor.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Context keys copied into the task input (and into the fingerprint).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reads: Vec<String>,
    /// Context key under which the step's output value is published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    /// Capability invoked to undo this step during compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,
    /// Kind-specific configuration.
    pub config: StepConfig,
}

fn default_required() -> bool {
    true
}

/// Kind-specific step configuration, internally tagged by `type`:
///
/// ```yaml
/// config:
///   type: sequential
///   capability: fetch
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke one capability; runs alone and blocks its dependents.
    Sequential { capability: String },
    /// Invoke one capability through the batch aggregator.
    Batch { capability: String },
    /// Fan out to member steps concurrently and join.
    Parallel { members: Vec<StepDefinition> },
    /// Evaluate a JEXL predicate over the context and select one branch.
    Conditional {
        condition: String,
        #[serde(default)]
        then_steps: Vec<String>,
        #[serde(default)]
        else_steps: Vec<String>,
    },
    /// Expand a sub-graph from a named generator at execution time.
    Recursive {
        capability: String,
        generator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_depth: Option<u32>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Sequential { .. } => StepKind::Sequential,
            StepConfig::Batch { .. } => StepKind::Batch,
            StepConfig::Parallel { .. } => StepKind::Parallel,
            StepConfig::Conditional { .. } => StepKind::Conditional,
            StepConfig::Recursive { .. } => StepKind::Recursive,
        }
    }
}

/// The kind of step in a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sequential,
    Parallel,
    Conditional,
    Recursive,
    Batch,
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry with exponential backoff: `base_delay_ms * 2^attempt`, capped at
/// `max_delay_ms`, optionally jittered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// No retries, no delay.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    Skipped,
}

impl StepStatus {
    /// Whether the step will not change status again during forward execution.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every executed step succeeded.
    Succeeded,
    /// Only non-required steps failed.
    PartiallySucceeded,
    /// A required step failed (or the run was cancelled) and every
    /// compensating action completed.
    Compensated,
    /// A required step failed (or the run was cancelled) and either a
    /// compensating action failed or no step had completed.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let config: RetryConfig = serde_yaml_ng::from_str("jitter: false").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.base_delay_ms, 100);
        assert!(!config.jitter);
    }

    #[test]
    fn test_step_definition_defaults() {
        let yaml = r#"
id: fetch
config:
  type: sequential
  capability: fetch
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(step.required);
        assert!(!step.cacheable);
        assert!(step.depends_on.is_empty());
        assert!(step.params.is_null());
        assert_eq!(step.config.kind(), StepKind::Sequential);
    }

    #[test]
    fn test_parallel_members_parse() {
        let yaml = r#"
name: review
steps:
  - id: checks
    config:
      type: parallel
      members:
        - id: analyze
          config: { type: sequential, capability: analysis }
        - id: scan
          required: false
          config: { type: sequential, capability: scan }
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, "1.0.0");
        match &def.steps[0].config {
            StepConfig::Parallel { members } => {
                assert_eq!(members.len(), 2);
                assert!(!members[1].required);
            }
            other => panic!("expected parallel, got {other:?}"),
        }
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Compensated.is_terminal());
    }
}
