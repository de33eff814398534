//! The run loop.
//!
//! Steps are dispatched in topological order as their dependencies complete,
//! under a per-run semaphore. Outcomes are collected from a JoinSet in
//! completion order, but every context merge is applied in topological
//! order, so a run's final context never depends on timing.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use conductor_types::event::EngineEvent;
use conductor_types::task::TaskOutput;
use conductor_types::workflow::{RunStatus, StepStatus};

use super::compensation::compensate;
use super::result::{CompensationOutcome, CompensationRecord, RunResult};
use super::state::{ExecutionState, StepOutcome};
use super::step_runner::{publish_output, spawn_step};
use super::{OrchestratorError, RunOptions};
use crate::context::ContextStore;
use crate::engine::Engine;
use crate::error::StepError;
use crate::graph::{Graph, Predicate, RecursionGuard, Step, StepAction, topological_order, validate};

/// Runs graphs on an engine's services.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run `graph` to completion.
    ///
    /// `concurrency_limit` overrides the graph's own limit and the engine
    /// default. Returns `Err` only when the graph is invalid; step failures
    /// are reported in the `RunResult`.
    pub async fn run(
        &self,
        graph: &Graph,
        initial: ContextStore,
        concurrency_limit: Option<usize>,
    ) -> Result<RunResult, OrchestratorError> {
        self.run_with(
            graph,
            initial,
            RunOptions {
                concurrency_limit,
                ..RunOptions::default()
            },
        )
        .await
    }

    pub async fn run_with(
        &self,
        graph: &Graph,
        initial: ContextStore,
        options: RunOptions,
    ) -> Result<RunResult, OrchestratorError> {
        execute_graph(Arc::clone(&self.engine), graph.clone(), initial, options.into()).await
    }
}

/// Shared by every step task of one run.
#[derive(Debug, Clone)]
pub(crate) struct RunScope {
    pub engine: Arc<Engine>,
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub permits: Arc<Semaphore>,
    pub bypass_cache: bool,
    pub guard: RecursionGuard,
}

/// What a caller hands to a new run. Nested runs inherit the parent's
/// semaphore and a child cancellation token.
#[derive(Debug, Default)]
pub(crate) struct RunSeed {
    pub cancel: CancellationToken,
    pub permits: Option<Arc<Semaphore>>,
    pub concurrency_limit: Option<usize>,
    pub bypass_cache: bool,
    pub guard: RecursionGuard,
}

impl From<RunOptions> for RunSeed {
    fn from(options: RunOptions) -> Self {
        Self {
            cancel: options.cancel,
            permits: None,
            concurrency_limit: options.concurrency_limit,
            bypass_cache: options.bypass_cache,
            guard: RecursionGuard::new(),
        }
    }
}

/// Boxed so recursive steps can start nested runs.
pub(crate) fn execute_graph(
    engine: Arc<Engine>,
    graph: Graph,
    initial: ContextStore,
    seed: RunSeed,
) -> BoxFuture<'static, Result<RunResult, OrchestratorError>> {
    let span = info_span!(
        "workflow.run",
        workflow = %graph.name(),
        depth = seed.guard.depth(),
        run_id = tracing::field::Empty,
    );
    Box::pin(drive(engine, graph, initial, seed).instrument(span))
}

async fn drive(
    engine: Arc<Engine>,
    graph: Graph,
    initial: ContextStore,
    seed: RunSeed,
) -> Result<RunResult, OrchestratorError> {
    validate(&graph)?;
    let order = topological_order(&graph)?;

    let limit = seed
        .concurrency_limit
        .or(graph.concurrency())
        .unwrap_or(engine.config().engine.default_concurrency)
        .max(1);
    let scope = RunScope {
        engine: Arc::clone(&engine),
        run_id: Uuid::now_v7(),
        cancel: seed.cancel,
        permits: seed
            .permits
            .unwrap_or_else(|| Arc::new(Semaphore::new(limit))),
        bypass_cache: seed.bypass_cache,
        guard: seed.guard,
    };
    let started = Instant::now();
    tracing::Span::current().record("run_id", tracing::field::display(scope.run_id));

    info!(
        run_id = %scope.run_id,
        workflow = %graph.name(),
        steps = graph.len(),
        depth = scope.guard.depth(),
        concurrency = limit,
        "workflow run started"
    );
    engine.events().publish(EngineEvent::RunStarted {
        run_id: scope.run_id,
        workflow_name: graph.name().to_string(),
        step_count: graph.len(),
    });

    let mut state = ExecutionState::new(&graph);
    let mut in_flight: JoinSet<StepOutcome> = JoinSet::new();
    // A running sequential step; nothing else starts until it finishes.
    let mut exclusive: Option<String> = None;
    let mut halted_by: Option<String> = None;

    loop {
        propagate_skips(&scope, &graph, &order, &mut state);

        let mut evaluated_inline = false;
        if halted_by.is_none() && !scope.cancel.is_cancelled() && exclusive.is_none() {
            for id in &order {
                let Some(step) = graph.get(id) else {
                    continue;
                };
                if state.status(id) != StepStatus::Pending || !dependencies_met(step, &state) {
                    continue;
                }
                match &step.action {
                    StepAction::Conditional {
                        predicate,
                        then_steps,
                        else_steps,
                        ..
                    } => {
                        evaluated_inline = true;
                        let view = state.view_for(&graph, &initial, &order, id);
                        let (outcome, unselected) =
                            evaluate_conditional(step, predicate, then_steps, else_steps, &view);
                        publish_outcome(&scope, &outcome);
                        if outcome.status == StepStatus::Failed && step.required {
                            warn!(run_id = %scope.run_id, step_id = %id, "required conditional failed, halting run");
                            halted_by = Some(id.clone());
                        }
                        state.record(outcome);
                        for skipped in &unselected {
                            if let Some(target) = graph.get(skipped) {
                                skip_step(&scope, &mut state, target, "branch not taken");
                            }
                        }
                        if halted_by.is_some() {
                            break;
                        }
                    }
                    StepAction::Sequential { .. } => {
                        if !in_flight.is_empty() {
                            break;
                        }
                        exclusive = Some(id.clone());
                        dispatch(&scope, &graph, &initial, &order, &mut state, &mut in_flight, step);
                        break;
                    }
                    _ => dispatch(&scope, &graph, &initial, &order, &mut state, &mut in_flight, step),
                }
            }
        }
        if evaluated_inline {
            continue;
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let outcome = joined.map_err(|err| OrchestratorError::Join(err.to_string()))?;
        if exclusive.as_deref() == Some(outcome.step_id.as_str()) {
            exclusive = None;
        }

        publish_outcome(&scope, &outcome);
        let required = graph.get(&outcome.step_id).is_none_or(|s| s.required);
        match outcome.status {
            StepStatus::Failed if required => {
                if halted_by.is_none() {
                    warn!(
                        run_id = %scope.run_id,
                        step_id = %outcome.step_id,
                        error = ?outcome.error.as_ref().map(ToString::to_string),
                        "required step failed, halting run"
                    );
                    halted_by = Some(outcome.step_id.clone());
                }
            }
            StepStatus::Failed => {
                warn!(
                    run_id = %scope.run_id,
                    step_id = %outcome.step_id,
                    error = ?outcome.error.as_ref().map(ToString::to_string),
                    "optional step failed, continuing"
                );
            }
            _ => {
                debug!(
                    run_id = %scope.run_id,
                    step_id = %outcome.step_id,
                    status = ?outcome.status,
                    attempts = outcome.attempts,
                    "step finished"
                );
            }
        }
        state.record(outcome);
    }

    let mut never_started = false;
    let reason = match &halted_by {
        Some(id) => format!("run halted after step '{id}' failed"),
        None if scope.cancel.is_cancelled() => "run cancelled".to_string(),
        None => "dependencies never satisfied".to_string(),
    };
    for id in &order {
        if state.status(id) == StepStatus::Pending {
            never_started = true;
            if let Some(step) = graph.get(id) {
                skip_step(&scope, &mut state, step, &reason);
            }
        }
    }
    let cancelled = scope.cancel.is_cancelled() && (never_started || state.any_cancelled());

    let compensation_log = if halted_by.is_some() || cancelled {
        compensate(
            &scope,
            &graph,
            &order,
            &mut state,
            &initial,
            halted_by.as_deref(),
            halted_by.is_none(),
        )
        .await
    } else {
        Vec::new()
    };

    let overall_status = overall_status(&state, halted_by.is_some() || cancelled, &compensation_log);
    let duration_ms = started.elapsed().as_millis() as u64;
    let result = RunResult {
        run_id: scope.run_id,
        workflow_name: graph.name().to_string(),
        overall_status,
        final_context: state.final_context(&initial, &order),
        step_results: state.step_results(&graph),
        error_log: state.error_log(&graph, &order),
        compensation_log,
        cancelled,
        duration_ms,
    };

    info!(
        run_id = %scope.run_id,
        workflow = %graph.name(),
        status = ?overall_status,
        errors = result.error_log.len(),
        duration_ms,
        "workflow run finished"
    );
    engine.events().publish(EngineEvent::RunCompleted {
        run_id: scope.run_id,
        workflow_name: graph.name().to_string(),
        status: overall_status,
        duration_ms,
    });
    Ok(result)
}

fn dispatch(
    scope: &RunScope,
    graph: &Graph,
    initial: &ContextStore,
    order: &[String],
    state: &mut ExecutionState,
    in_flight: &mut JoinSet<StepOutcome>,
    step: &Step,
) {
    let view = Arc::new(state.view_for(graph, initial, order, &step.id));
    state.set_running(step);
    spawn_step(in_flight, scope.clone(), step.clone(), view);
}

/// Ready once every dependency has succeeded or been skipped. Steps whose
/// dependencies all skipped were already skipped themselves.
fn dependencies_met(step: &Step, state: &ExecutionState) -> bool {
    step.depends_on
        .iter()
        .all(|dep| matches!(state.status(dep), StepStatus::Succeeded | StepStatus::Skipped))
}

/// Skip every pending step downstream of a failure, or whose dependencies
/// were all skipped. One pass in topological order reaches the fixpoint.
fn propagate_skips(scope: &RunScope, graph: &Graph, order: &[String], state: &mut ExecutionState) {
    for id in order {
        if state.status(id) != StepStatus::Pending {
            continue;
        }
        let Some(step) = graph.get(id) else {
            continue;
        };
        let reason = if let Some(failed) = step
            .depends_on
            .iter()
            .find(|dep| state.status(dep) == StepStatus::Failed)
        {
            format!("dependency '{failed}' failed")
        } else if !step.depends_on.is_empty()
            && step
                .depends_on
                .iter()
                .all(|dep| state.status(dep) == StepStatus::Skipped)
        {
            "all dependencies skipped".to_string()
        } else {
            continue;
        };
        skip_step(scope, state, step, &reason);
    }
}

fn skip_step(scope: &RunScope, state: &mut ExecutionState, step: &Step, reason: &str) {
    debug!(run_id = %scope.run_id, step_id = %step.id, reason, "step skipped");
    state.skip(step, reason);
    scope.engine.events().publish(EngineEvent::StepSkipped {
        run_id: scope.run_id,
        step_id: step.id.clone(),
        reason: reason.to_string(),
    });
}

/// Returns the outcome and the IDs of the branch that was not taken.
fn evaluate_conditional(
    step: &Step,
    predicate: &Predicate,
    then_steps: &[String],
    else_steps: &[String],
    view: &crate::context::ContextView,
) -> (StepOutcome, Vec<String>) {
    let started = Instant::now();
    match predicate(view) {
        Ok(taken) => {
            let (branch, selected, unselected) = if taken {
                ("then", then_steps, else_steps)
            } else {
                ("else", else_steps, then_steps)
            };
            let output = TaskOutput::new(serde_json::json!({
                "branch": branch,
                "selected": selected,
            }));
            let outcome = StepOutcome::succeeded(step, publish_output(step, output), 1, false, started.elapsed());
            (outcome, unselected.to_vec())
        }
        Err(err) => {
            let outcome = StepOutcome::failed(step, StepError::from(err), 1, started.elapsed());
            (outcome, Vec::new())
        }
    }
}

fn publish_outcome(scope: &RunScope, outcome: &StepOutcome) {
    for member in &outcome.members {
        publish_outcome(scope, member);
    }
    let event = match outcome.status {
        StepStatus::Succeeded => EngineEvent::StepCompleted {
            run_id: scope.run_id,
            step_id: outcome.step_id.clone(),
            attempts: outcome.attempts,
            duration_ms: outcome.duration.as_millis() as u64,
        },
        StepStatus::Failed => {
            let Some(error) = &outcome.error else {
                return;
            };
            EngineEvent::StepFailed {
                run_id: scope.run_id,
                step_id: outcome.step_id.clone(),
                class: error.class(),
                error: error.to_string(),
                attempts: outcome.attempts,
            }
        }
        StepStatus::Skipped => EngineEvent::StepSkipped {
            run_id: scope.run_id,
            step_id: outcome.step_id.clone(),
            reason: outcome.skip_reason.clone().unwrap_or_default(),
        },
        _ => return,
    };
    scope.engine.events().publish(event);
}

/// - Halted or cancelled: `Compensated` when every compensation ran and at
///   least one step had completed, otherwise `Failed`.
/// - Otherwise `PartiallySucceeded` if any optional step failed.
fn overall_status(state: &ExecutionState, interrupted: bool, compensation: &[CompensationRecord]) -> RunStatus {
    if interrupted {
        let compensation_failed = compensation
            .iter()
            .any(|r| matches!(r.outcome, CompensationOutcome::Failed { .. }));
        let anything_completed =
            state.any_with_status(StepStatus::Succeeded) || state.any_with_status(StepStatus::Compensated);
        if compensation_failed || !anything_completed {
            RunStatus::Failed
        } else {
            RunStatus::Compensated
        }
    } else if state.any_with_status(StepStatus::Failed) {
        RunStatus::PartiallySucceeded
    } else {
        RunStatus::Succeeded
    }
}
