//! Saga-style compensation after a halted or cancelled run.

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conductor_types::event::EngineEvent;
use conductor_types::task::{Capability, Task, TaskConstraints, TaskOutput};
use conductor_types::workflow::StepStatus;

use super::result::{CompensationOutcome, CompensationRecord};
use super::scheduler::RunScope;
use super::state::ExecutionState;
use super::step_runner::{dispatch_direct, step_timeout};
use crate::context::{ContextStore, ContextView};
use crate::error::StepError;
use crate::graph::{Graph, Step};
use crate::resilience::CallSite;

/// Undo completed steps in reverse topological order.
///
/// A parallel group's own compensation runs before its members', which run
/// in reverse declaration order. After a cancellation only required steps
/// are compensated. Compensation ignores the run's cancellation token.
pub(crate) async fn compensate(
    scope: &RunScope,
    graph: &Graph,
    order: &[String],
    state: &mut ExecutionState,
    initial: &ContextStore,
    failed_step: Option<&str>,
    required_only: bool,
) -> Vec<CompensationRecord> {
    warn!(
        run_id = %scope.run_id,
        failed_step = ?failed_step,
        "compensating completed steps"
    );
    scope.engine.events().publish(EngineEvent::CompensationStarted {
        run_id: scope.run_id,
        failed_step: failed_step.map(str::to_string),
    });

    let view = state.final_context(initial, order).view();
    let cancel = CancellationToken::new();
    let mut log = Vec::new();

    for id in order.iter().rev() {
        let Some(step) = graph.get(id) else {
            continue;
        };
        for target in std::iter::once(step).chain(step.members().iter().rev()) {
            if state.status(&target.id) != StepStatus::Succeeded {
                continue;
            }
            if required_only && !(step.required && target.required) {
                continue;
            }
            let Some(capability) = target.compensation.clone() else {
                log.push(CompensationRecord {
                    step_id: target.id.clone(),
                    capability: None,
                    outcome: CompensationOutcome::NoAction,
                });
                continue;
            };

            let result = run_compensation(
                scope,
                target,
                &capability,
                state.output(&target.id),
                &view,
                &cancel,
            )
            .await;
            let outcome = match result {
                Ok(()) => {
                    info!(run_id = %scope.run_id, step_id = %target.id, capability = %capability, "step compensated");
                    state.mark_compensated(&target.id);
                    scope.engine.events().publish(EngineEvent::StepCompensated {
                        run_id: scope.run_id,
                        step_id: target.id.clone(),
                        capability: capability.to_string(),
                    });
                    CompensationOutcome::Compensated
                }
                Err(err) => {
                    error!(run_id = %scope.run_id, step_id = %target.id, error = %err, "compensation failed");
                    CompensationOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            log.push(CompensationRecord {
                step_id: target.id.clone(),
                capability: Some(capability),
                outcome,
            });
        }
    }
    log
}

async fn run_compensation(
    scope: &RunScope,
    step: &Step,
    capability: &Capability,
    output: Option<&TaskOutput>,
    view: &ContextView,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    let engine = &scope.engine;
    let executor = engine.registry().resolve(capability)?;
    let timeout = step_timeout(step, engine.config());
    let task = Task {
        id: format!("{}:{}:compensate", scope.run_id, step.id),
        step_id: step.id.clone(),
        capability: capability.clone(),
        input: json!({
            "step_id": step.id,
            "params": step.params,
            "output": output.map(|o| o.value.clone()).unwrap_or(Value::Null),
        }),
        constraints: TaskConstraints {
            timeout_ms: Some(timeout.as_millis() as u64),
            cacheable: false,
        },
    };
    let site = CallSite {
        run_id: scope.run_id,
        step_id: step.id.clone(),
        capability: capability.clone(),
    };

    let (executor, task) = (&executor, &task);
    engine
        .resilience()
        .call_within(&site, &engine.config().retry, cancel, Some(timeout), move |_attempt| async move {
            dispatch_direct(scope, executor, task, view).await
        })
        .await
        .result
        .map(|_| ())
}
