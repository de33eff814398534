//! Executes one dispatched step.
//!
//! Leaf steps go through the memoization cache and the resilience policy.
//! Parallel groups fan their members out on a JoinSet; recursive steps
//! expand a sub-graph and run it as a nested run sharing the parent's
//! concurrency budget and cancellation.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use tokio::sync::SemaphorePermit;
use tokio::task::JoinSet;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use conductor_types::ENGINE_VERSION;
use conductor_types::config::EngineConfig;
use conductor_types::event::EngineEvent;
use conductor_types::task::{Capability, Proposal, Task, TaskConstraints, TaskOutput};
use conductor_types::workflow::{RunStatus, StepStatus};

use super::scheduler::{RunScope, RunSeed, execute_graph};
use super::state::StepOutcome;
use crate::cache::Fingerprint;
use crate::context::{ContextStore, ContextView};
use crate::error::StepError;
use crate::executor::BoxExecutor;
use crate::graph::{RecursionGuard, Step, StepAction, SubGraphGenerator};
use crate::resilience::CallSite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Direct,
    Batched,
}

/// Spawn a step onto `set`. A panic inside the step becomes a failed outcome.
pub(crate) fn spawn_step(set: &mut JoinSet<StepOutcome>, scope: RunScope, step: Step, view: Arc<ContextView>) {
    let span = info_span!(
        "workflow.step",
        run_id = %scope.run_id,
        step_id = %step.id,
        kind = ?step.kind(),
        capability = step.capability().map(|c| c.as_str()),
    );
    let task = async move {
        let started = Instant::now();
        match AssertUnwindSafe(run_step(&scope, &step, &view))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let error = StepError::from_panic(panic);
                tracing::error!(
                    run_id = %scope.run_id,
                    step_id = %step.id,
                    error = %error,
                    "step panicked"
                );
                StepOutcome::failed(&step, error, 1, started.elapsed())
            }
        }
    };
    set.spawn(task.instrument(span));
}

async fn run_step(scope: &RunScope, step: &Step, view: &Arc<ContextView>) -> StepOutcome {
    match &step.action {
        StepAction::Sequential { capability } => {
            invoke(scope, step, capability, view, Dispatch::Direct).await
        }
        StepAction::Batch { capability } => {
            invoke(scope, step, capability, view, Dispatch::Batched).await
        }
        StepAction::Parallel { members } => run_parallel(scope, step, members, view).await,
        StepAction::Recursive {
            capability,
            generator,
            max_depth,
        } => run_recursive(scope, step, capability, generator.as_ref(), *max_depth, view).await,
        // Conditionals never reach a worker; the scheduler evaluates them inline.
        StepAction::Conditional { .. } => StepOutcome::failed(
            step,
            StepError::InvalidGraph(format!("conditional step '{}' was dispatched", step.id)),
            0,
            Duration::ZERO,
        ),
    }
}

// ---------------------------------------------------------------------------
// Leaf steps
// ---------------------------------------------------------------------------

async fn invoke(
    scope: &RunScope,
    step: &Step,
    capability: &Capability,
    view: &Arc<ContextView>,
    mode: Dispatch,
) -> StepOutcome {
    let started = Instant::now();
    let engine = &scope.engine;
    publish_started(scope, step, Some(capability));

    let task = build_task(scope.run_id, step, capability, view, engine.config());
    let executor = match engine.registry().resolve(capability) {
        Ok(executor) => executor,
        Err(err) => return StepOutcome::failed(step, err.into(), 0, started.elapsed()),
    };

    let fingerprint = step.cacheable.then(|| {
        Fingerprint::compute(
            capability,
            &executor.normalize_input(&task.input),
            &view.slice(&step.reads),
            ENGINE_VERSION,
        )
    });
    if let Some(fingerprint) = &fingerprint {
        if !scope.bypass_cache {
            if let Some(output) = engine.cache().get(fingerprint) {
                tracing::debug!(
                    run_id = %scope.run_id,
                    step_id = %step.id,
                    fingerprint = %fingerprint,
                    "cache hit"
                );
                engine.events().publish(EngineEvent::StepCacheHit {
                    run_id: scope.run_id,
                    step_id: step.id.clone(),
                    fingerprint: fingerprint.to_string(),
                });
                return StepOutcome::succeeded(step, publish_output(step, output), 0, true, started.elapsed());
            }
        }
    }

    let retry = step.retry.clone().unwrap_or_else(|| engine.config().retry.clone());
    let timeout = step_timeout(step, engine.config());
    let site = CallSite {
        run_id: scope.run_id,
        step_id: step.id.clone(),
        capability: capability.clone(),
    };
    let (executor_ref, task_ref, batcher) = (&executor, &task, engine.batcher());
    let outcome = engine
        .resilience()
        .call_within(&site, &retry, &scope.cancel, Some(timeout), move |_attempt| async move {
            // Proposals from a failed attempt must not leak into the next one.
            view.discard_proposals();
            match mode {
                Dispatch::Direct => dispatch_direct(scope, executor_ref, task_ref, view).await,
                Dispatch::Batched => {
                    let _permit = acquire(scope).await?;
                    batcher.submit(task_ref.clone(), Arc::clone(view)).await
                }
            }
        })
        .await;

    match outcome.result {
        Ok(output) => {
            if let Some(fingerprint) = &fingerprint {
                let ttl = engine.cache().ttl_for(capability, executor.cache_ttl());
                engine.cache().put(fingerprint, output.clone(), ttl);
            }
            StepOutcome::succeeded(
                step,
                publish_output(step, output),
                outcome.attempts,
                false,
                started.elapsed(),
            )
        }
        Err(error) => StepOutcome::failed(step, error, outcome.attempts, started.elapsed()),
    }
}

/// One direct executor invocation under a concurrency permit.
/// Proposals made through the view are appended to the output.
pub(crate) async fn dispatch_direct(
    scope: &RunScope,
    executor: &BoxExecutor,
    task: &Task,
    view: &ContextView,
) -> Result<TaskOutput, StepError> {
    let _permit = acquire(scope).await?;
    let mut output = executor.execute(task, view).await?;
    output.proposals.extend(view.take_proposals());
    Ok(output)
}

async fn acquire(scope: &RunScope) -> Result<SemaphorePermit<'_>, StepError> {
    scope.permits.acquire().await.map_err(|_| StepError::Cancelled)
}

pub(crate) fn step_timeout(step: &Step, config: &EngineConfig) -> Duration {
    step.timeout
        .unwrap_or_else(|| Duration::from_millis(config.engine.default_step_timeout_ms))
}

fn build_task(run_id: Uuid, step: &Step, capability: &Capability, view: &ContextView, config: &EngineConfig) -> Task {
    let context: Map<String, Value> = view.slice(&step.reads).into_iter().collect();
    Task {
        id: format!("{run_id}:{}", step.id),
        step_id: step.id.clone(),
        capability: capability.clone(),
        input: json!({ "params": step.params, "context": context }),
        constraints: TaskConstraints {
            timeout_ms: Some(step_timeout(step, config).as_millis() as u64),
            cacheable: step.cacheable,
        },
    }
}

/// Append the `output_key` proposal, if the step declares one.
pub(crate) fn publish_output(step: &Step, mut output: TaskOutput) -> TaskOutput {
    if let Some(key) = &step.output_key {
        output.proposals.push(Proposal {
            key: key.clone(),
            value: output.value.clone(),
        });
    }
    output
}

fn publish_started(scope: &RunScope, step: &Step, capability: Option<&Capability>) {
    tracing::debug!(
        run_id = %scope.run_id,
        step_id = %step.id,
        kind = ?step.kind(),
        "step started"
    );
    scope.engine.events().publish(EngineEvent::StepStarted {
        run_id: scope.run_id,
        step_id: step.id.clone(),
        capability: capability.map(ToString::to_string),
    });
}

// ---------------------------------------------------------------------------
// Parallel groups
// ---------------------------------------------------------------------------

async fn run_parallel(scope: &RunScope, step: &Step, members: &[Step], view: &Arc<ContextView>) -> StepOutcome {
    let started = Instant::now();
    publish_started(scope, step, None);

    let group_cancel = scope.cancel.child_token();
    let member_scope = RunScope {
        cancel: group_cancel.clone(),
        ..scope.clone()
    };
    let mut set = JoinSet::new();
    for member in members {
        // Each member buffers its own proposals.
        let member_view = Arc::new(ContextView::new(view.values().clone(), view.generation()));
        spawn_step(&mut set, member_scope.clone(), member.clone(), member_view);
    }

    let required: HashSet<&str> = members
        .iter()
        .filter(|m| m.required)
        .map(|m| m.id.as_str())
        .collect();
    let mut finished: HashMap<String, StepOutcome> = HashMap::new();
    let mut first_failure: Option<(String, StepError)> = None;
    while let Some(joined) = set.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(step_id = %step.id, error = %err, "parallel member task failed to join");
                continue;
            }
        };
        if outcome.status == StepStatus::Failed
            && first_failure.is_none()
            && required.contains(outcome.step_id.as_str())
        {
            tracing::warn!(
                run_id = %scope.run_id,
                step_id = %step.id,
                member = %outcome.step_id,
                "required member failed, cancelling the rest of the group"
            );
            if let Some(error) = &outcome.error {
                first_failure = Some((outcome.step_id.clone(), error.clone()));
            }
            group_cancel.cancel();
        }
        finished.insert(outcome.step_id.clone(), outcome);
    }

    let outcomes: Vec<StepOutcome> = members
        .iter()
        .filter_map(|m| finished.remove(&m.id))
        .map(|outcome| {
            let never_ran = outcome.attempts == 0
                && matches!(outcome.error, Some(StepError::Cancelled));
            if never_ran {
                StepOutcome::skipped(&outcome.step_id, "parallel group failed fast")
            } else {
                outcome
            }
        })
        .collect();
    let attempts = outcomes.iter().map(|o| o.attempts).max().unwrap_or(0);

    if let Some((member, error)) = first_failure {
        let error = StepError::Member {
            member,
            source: Box::new(error),
        };
        return StepOutcome::failed(step, error, attempts, started.elapsed()).with_members(outcomes);
    }

    let output = publish_output(step, join_members(&outcomes));
    let cached = !outcomes.is_empty() && outcomes.iter().all(|o| o.cached);
    StepOutcome::succeeded(step, output, attempts, cached, started.elapsed()).with_members(outcomes)
}

/// Combine member outputs. On conflicting keys the earliest-declared member
/// wins; within one member the last proposal for a key wins.
fn join_members(outcomes: &[StepOutcome]) -> TaskOutput {
    let mut value = Map::new();
    let mut proposals: Vec<Proposal> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();
    for outcome in outcomes {
        let Some(output) = outcome.output.as_ref() else {
            continue;
        };
        value.insert(outcome.step_id.clone(), output.value.clone());

        let mut own: Vec<Proposal> = Vec::new();
        for proposal in &output.proposals {
            match own.iter_mut().find(|p| p.key == proposal.key) {
                Some(existing) => existing.value = proposal.value.clone(),
                None => own.push(proposal.clone()),
            }
        }
        for proposal in own {
            if taken.insert(proposal.key.clone()) {
                proposals.push(proposal);
            }
        }
    }
    TaskOutput {
        value: Value::Object(value),
        proposals,
    }
}

// ---------------------------------------------------------------------------
// Recursive steps
// ---------------------------------------------------------------------------

async fn run_recursive(
    scope: &RunScope,
    step: &Step,
    capability: &Capability,
    generator: &dyn SubGraphGenerator,
    max_depth: Option<u32>,
    view: &Arc<ContextView>,
) -> StepOutcome {
    let started = Instant::now();
    publish_started(scope, step, Some(capability));
    let config = scope.engine.config();

    let task = build_task(scope.run_id, step, capability, view, config);
    let key = RecursionGuard::level_key(capability, &task.input);
    let limit = max_depth.unwrap_or(config.engine.max_recursion_depth);
    let guard = match scope.guard.descend(key, limit) {
        Ok(guard) => guard,
        Err(err) => {
            tracing::warn!(run_id = %scope.run_id, step_id = %step.id, error = %err, "recursion refused");
            return StepOutcome::failed(step, err.into(), 0, started.elapsed());
        }
    };
    let depth = guard.depth();

    let subgraph = match generator.expand(view, depth) {
        Ok(Some(graph)) => graph,
        Ok(None) => {
            let output = TaskOutput::new(json!({ "depth": depth, "expanded": false }));
            return StepOutcome::succeeded(step, publish_output(step, output), 1, false, started.elapsed());
        }
        Err(err) => return StepOutcome::failed(step, err.into(), 1, started.elapsed()),
    };

    tracing::debug!(
        run_id = %scope.run_id,
        step_id = %step.id,
        depth,
        steps = subgraph.len(),
        "expanding recursive step"
    );
    let seed = RunSeed {
        cancel: scope.cancel.child_token(),
        permits: Some(Arc::clone(&scope.permits)),
        concurrency_limit: None,
        bypass_cache: scope.bypass_cache,
        guard,
    };
    let initial = ContextStore::from_values(view.values().clone());
    let result = match execute_graph(Arc::clone(&scope.engine), subgraph, initial, seed).await {
        Ok(result) => result,
        Err(err) => {
            let error = match err {
                super::OrchestratorError::Graph(graph_err) => StepError::from(graph_err),
                other => StepError::InvalidGraph(other.to_string()),
            };
            return StepOutcome::failed(step, error, 1, started.elapsed());
        }
    };

    match result.overall_status {
        RunStatus::Succeeded | RunStatus::PartiallySucceeded => {
            let mut output = TaskOutput::new(json!({
                "depth": depth,
                "expanded": true,
                "run_id": result.run_id,
                "status": result.overall_status,
            }));
            for (key, value) in result.final_context.latest() {
                if view.read(&key) != Some(&value) {
                    output.proposals.push(Proposal { key, value });
                }
            }
            StepOutcome::succeeded(step, publish_output(step, output), 1, false, started.elapsed())
        }
        status => {
            // A limit hit deeper down is reported as itself, not as a sub-run failure.
            let error = result
                .error_log
                .iter()
                .filter_map(|record| record.cause.as_ref())
                .map(StepError::root)
                .find(|e| matches!(e, StepError::RecursionLimit { .. }))
                .cloned()
                .unwrap_or(StepError::SubRun { status });
            StepOutcome::failed(step, error, 1, started.elapsed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, output: TaskOutput) -> StepOutcome {
        StepOutcome::succeeded(&Step::sequential(id, "x"), output, 1, false, Duration::ZERO)
    }

    #[test]
    fn test_join_members_earliest_declared_wins() {
        let outcomes = vec![
            outcome(
                "first",
                TaskOutput::new(json!(1))
                    .propose("shared", json!("a"))
                    .propose("shared", json!("a2")),
            ),
            outcome(
                "second",
                TaskOutput::new(json!(2))
                    .propose("shared", json!("b"))
                    .propose("only_b", json!(true)),
            ),
        ];
        let joined = join_members(&outcomes);
        assert_eq!(joined.value, json!({"first": 1, "second": 2}));
        assert_eq!(joined.proposals.len(), 2);
        assert_eq!(joined.proposals[0].key, "shared");
        assert_eq!(joined.proposals[0].value, json!("a2"));
        assert_eq!(joined.proposals[1].key, "only_b");
    }

    #[test]
    fn test_publish_output_adds_key() {
        let step = Step::sequential("s", "x").output_key("result");
        let output = publish_output(&step, TaskOutput::new(json!({"n": 1})));
        assert_eq!(output.proposals.len(), 1);
        assert_eq!(output.proposals[0].key, "result");
        assert_eq!(output.proposals[0].value, json!({"n": 1}));
    }

    #[test]
    fn test_build_task_slices_reads() {
        let mut values = std::collections::BTreeMap::new();
        values.insert("repo".to_string(), json!("conductor"));
        values.insert("secret".to_string(), json!("hidden"));
        let view = ContextView::new(values, 1);
        let step = Step::sequential("fetch", "fetch")
            .reads(&["repo", "missing"])
            .with_params(json!({"depth": 2}))
            .with_timeout(Duration::from_millis(250));

        let task = build_task(Uuid::nil(), &step, &Capability::new("fetch"), &view, &EngineConfig::default());
        assert_eq!(task.id, format!("{}:fetch", Uuid::nil()));
        assert_eq!(task.params(), &json!({"depth": 2}));
        assert_eq!(task.context_value("repo"), Some(&json!("conductor")));
        assert!(task.context_value("secret").is_none());
        assert_eq!(task.constraints.timeout_ms, Some(250));
    }
}
