//! Engine event logging.
//!
//! Subscribes to the engine's broadcast channel and writes every lifecycle
//! event as a structured `tracing` record under the `conductor::events`
//! target. Levels: info for run boundaries, debug for step transitions,
//! warn for retries, failures and compensation.

use conductor_types::event::EngineEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EVENT_TARGET: &str = "conductor::events";

/// Log events until every sender is dropped.
///
/// A lagging receiver logs how many events it missed and keeps going.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<EngineEvent>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    log_event(&event);
                    logged += 1;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(target: EVENT_TARGET, missed, "event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        logged
    })
}

pub fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted {
            run_id,
            workflow_name,
            step_count,
        } => info!(target: EVENT_TARGET, %run_id, workflow = %workflow_name, step_count, "run started"),
        EngineEvent::StepStarted {
            run_id,
            step_id,
            capability,
        } => debug!(target: EVENT_TARGET, %run_id, step_id = %step_id, capability = capability.as_deref(), "step started"),
        EngineEvent::StepRetrying {
            run_id,
            step_id,
            attempt,
            delay_ms,
            error,
        } => warn!(target: EVENT_TARGET, %run_id, step_id = %step_id, attempt, delay_ms, error = %error, "step retrying"),
        EngineEvent::StepCacheHit {
            run_id,
            step_id,
            fingerprint,
        } => debug!(target: EVENT_TARGET, %run_id, step_id = %step_id, fingerprint = %fingerprint, "step served from cache"),
        EngineEvent::StepCompleted {
            run_id,
            step_id,
            attempts,
            duration_ms,
        } => debug!(target: EVENT_TARGET, %run_id, step_id = %step_id, attempts, duration_ms, "step completed"),
        EngineEvent::StepFailed {
            run_id,
            step_id,
            class,
            error,
            attempts,
        } => warn!(target: EVENT_TARGET, %run_id, step_id = %step_id, class = class.as_str(), attempts, error = %error, "step failed"),
        EngineEvent::StepSkipped {
            run_id,
            step_id,
            reason,
        } => debug!(target: EVENT_TARGET, %run_id, step_id = %step_id, reason = %reason, "step skipped"),
        EngineEvent::CircuitOpened {
            capability,
            consecutive_failures,
        } => warn!(target: EVENT_TARGET, capability = %capability, consecutive_failures, "circuit opened"),
        EngineEvent::CompensationStarted { run_id, failed_step } => {
            warn!(target: EVENT_TARGET, %run_id, failed_step = failed_step.as_deref(), "compensation started")
        }
        EngineEvent::StepCompensated {
            run_id,
            step_id,
            capability,
        } => info!(target: EVENT_TARGET, %run_id, step_id = %step_id, capability = %capability, "step compensated"),
        EngineEvent::RunCompleted {
            run_id,
            workflow_name,
            status,
            duration_ms,
        } => info!(target: EVENT_TARGET, %run_id, workflow = %workflow_name, status = ?status, duration_ms, "run completed"),
    }
}
