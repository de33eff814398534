//! Step-level failure taxonomy.
//!
//! `ExecutorError` (from `conductor-types`) is what executors return.
//! `StepError` is what the engine records: executor failures plus the
//! failures the engine itself produces around a dispatch.

use std::any::Any;

use conductor_types::error::{ErrorClass, ExecutorError};
use conductor_types::workflow::RunStatus;
use thiserror::Error;

use crate::executor::registry::RegistryError;
use crate::graph::GraphError;

/// How a failure affects the capability's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEffect {
    /// Counts toward opening the breaker.
    Failure,
    /// The dependency answered; resets the failure streak.
    Healthy,
    /// The dependency was never reached.
    Neutral,
}

/// Why a step did not succeed.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("circuit open for capability '{capability}'")]
    CircuitOpen { capability: String },

    #[error("no executor registered for capability '{0}'")]
    NotFound(String),

    #[error("step cancelled")]
    Cancelled,

    #[error("recursion limit reached at depth {depth}: {reason}")]
    RecursionLimit { depth: u32, reason: String },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("sub-run finished with status {status:?}")]
    SubRun { status: RunStatus },

    #[error("member '{member}' failed: {source}")]
    Member {
        member: String,
        source: Box<StepError>,
    },

    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Executor(e) => e.class(),
            StepError::Timeout { .. } | StepError::CircuitOpen { .. } => ErrorClass::Transient,
            StepError::NotFound(_)
            | StepError::Cancelled
            | StepError::SubRun { .. }
            | StepError::Panicked(_) => ErrorClass::Permanent,
            StepError::RecursionLimit { .. } | StepError::InvalidGraph(_) => ErrorClass::Validation,
            StepError::Member { source, .. } => source.class(),
        }
    }

    /// Short machine-readable discriminator for error logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Executor(_) => "executor",
            StepError::Timeout { .. } => "timeout",
            StepError::CircuitOpen { .. } => "circuit_open",
            StepError::NotFound(_) => "not_found",
            StepError::Cancelled => "cancelled",
            StepError::RecursionLimit { .. } => "recursion_limit",
            StepError::InvalidGraph(_) => "invalid_graph",
            StepError::SubRun { .. } => "sub_run",
            StepError::Member { source, .. } => source.kind(),
            StepError::Panicked(_) => "panicked",
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn breaker_effect(&self) -> BreakerEffect {
        match self {
            StepError::Executor(e) if e.is_retryable() => BreakerEffect::Failure,
            StepError::Executor(_) => BreakerEffect::Healthy,
            StepError::Timeout { .. } | StepError::Panicked(_) => BreakerEffect::Failure,
            _ => BreakerEffect::Neutral,
        }
    }

    /// Wrap a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        StepError::Panicked(message)
    }

    /// The innermost error, looking through parallel-group wrapping.
    pub fn root(&self) -> &StepError {
        match self {
            StepError::Member { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<RegistryError> for StepError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(capability) => StepError::NotFound(capability.to_string()),
        }
    }
}

impl From<GraphError> for StepError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::RecursionLimit { depth, reason } => {
                StepError::RecursionLimit { depth, reason }
            }
            other => StepError::InvalidGraph(other.to_string()),
        }
    }
}
