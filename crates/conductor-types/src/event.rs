//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast during workflow execution. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::workflow::RunStatus;

/// Lifecycle events emitted by the orchestrator and the resilience layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        step_count: usize,
    },

    StepStarted {
        run_id: Uuid,
        step_id: String,
        capability: Option<String>,
    },

    /// A transient failure will be retried after `delay_ms`.
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A cacheable step was served from the memoization cache.
    StepCacheHit {
        run_id: Uuid,
        step_id: String,
        fingerprint: String,
    },

    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    StepFailed {
        run_id: Uuid,
        step_id: String,
        class: ErrorClass,
        error: String,
        attempts: u32,
    },

    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// A capability's breaker tripped and now fails fast.
    CircuitOpened {
        capability: String,
        consecutive_failures: u32,
    },

    CompensationStarted {
        run_id: Uuid,
        failed_step: Option<String>,
    },

    StepCompensated {
        run_id: Uuid,
        step_id: String,
        capability: String,
    },

    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        status: RunStatus,
        duration_ms: u64,
    },
}
