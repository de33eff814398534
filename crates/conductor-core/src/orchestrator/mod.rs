//! Graph execution: scheduling, step dispatch, compensation.

mod compensation;
pub mod result;
mod scheduler;
mod state;
mod step_runner;

use tokio_util::sync::CancellationToken;

use crate::graph::GraphError;

pub use result::{CompensationOutcome, CompensationRecord, RunResult, StepErrorRecord, StepResult};
pub use scheduler::Orchestrator;

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the graph's and the engine's concurrency limit.
    pub concurrency_limit: Option<usize>,
    /// Cancelling stops dispatch; completed required steps are compensated.
    pub cancel: CancellationToken,
    /// Skip cache reads. Results are still written.
    pub bypass_cache: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),

    #[error("step task failed to join: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{Value, json};

    use conductor_types::config::{BreakerConfig, EngineConfig};
    use conductor_types::error::ExecutorError;
    use conductor_types::event::EngineEvent;
    use conductor_types::state::CircuitStateKind;
    use conductor_types::task::{Capability, Task, TaskOutput};
    use conductor_types::workflow::{RetryConfig, RunStatus, StepStatus};

    use super::*;
    use crate::context::{ContextStore, ContextView};
    use crate::engine::Engine;
    use crate::executor::{BatchItem, Executor, ExecutorRegistry};
    use crate::graph::{Graph, Step, SubGraphGenerator};

    // -- fixtures -------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn record(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Echoes the step ID and params, optionally after a per-step delay.
    struct Echo {
        journal: Journal,
        delays: HashMap<String, u64>,
    }

    impl Echo {
        fn new(journal: &Journal) -> Self {
            Self {
                journal: journal.clone(),
                delays: HashMap::new(),
            }
        }

        fn delayed(mut self, step_id: &str, ms: u64) -> Self {
            self.delays.insert(step_id.to_string(), ms);
            self
        }
    }

    impl Executor for Echo {
        async fn execute(&self, task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            self.journal.record(task.step_id.clone());
            if let Some(ms) = self.delays.get(&task.step_id) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            Ok(TaskOutput::new(json!({ "step": task.step_id, "params": task.params() })))
        }
    }

    /// Fails transiently a fixed number of times, then succeeds.
    struct Flaky {
        journal: Journal,
        failures_left: AtomicU32,
    }

    impl Executor for Flaky {
        async fn execute(&self, task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            self.journal.record(task.step_id.clone());
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(ExecutorError::transient("503 from upstream"));
            }
            Ok(TaskOutput::new(json!("ok")))
        }
    }

    /// Transient failures until switched healthy.
    struct Switch {
        journal: Journal,
        healthy: Arc<AtomicBool>,
    }

    impl Executor for Switch {
        async fn execute(&self, task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            self.journal.record(task.step_id.clone());
            if self.healthy.load(Ordering::SeqCst) {
                Ok(TaskOutput::new(json!("up")))
            } else {
                Err(ExecutorError::transient("connection refused"))
            }
        }
    }

    struct Broken;

    impl Executor for Broken {
        async fn execute(&self, _task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            Err(ExecutorError::permanent("unsupported input"))
        }
    }

    struct Undo {
        journal: Journal,
    }

    impl Executor for Undo {
        async fn execute(&self, task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            self.journal.record(format!("undo:{}", task.step_id));
            Ok(TaskOutput::new(Value::Null))
        }
    }

    struct Canceller {
        token: tokio_util::sync::CancellationToken,
    }

    impl Executor for Canceller {
        async fn execute(&self, _task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            self.token.cancel();
            Ok(TaskOutput::new(json!("done")))
        }
    }

    struct Panicker;

    impl Executor for Panicker {
        async fn execute(&self, _task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            panic!("executor exploded")
        }
    }

    /// Fails transiently, then panics, then recovers.
    #[derive(Default)]
    struct Relapse {
        calls: AtomicU32,
    }

    impl Executor for Relapse {
        async fn execute(&self, _task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ExecutorError::transient("connection reset")),
                1 => panic!("probe exploded"),
                _ => Ok(TaskOutput::new(json!("back"))),
            }
        }
    }

    /// Takes a while, then fails transiently.
    struct Sluggish {
        delay_ms: u64,
    }

    impl Executor for Sluggish {
        async fn execute(&self, _task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Err(ExecutorError::transient("gateway timeout"))
        }
    }

    #[derive(Clone, Default)]
    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Executor for Gauge {
        async fn execute(&self, _task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(TaskOutput::new(Value::Null))
        }
    }

    /// Doubles `params.n`; counts batch dispatches.
    #[derive(Clone, Default)]
    struct Doubler {
        batches: Arc<AtomicUsize>,
    }

    fn double(task: &Task) -> TaskOutput {
        TaskOutput::new(json!(task.params()["n"].as_i64().unwrap_or(0) * 2))
    }

    impl Executor for Doubler {
        async fn execute(&self, task: &Task, _ctx: &ContextView) -> Result<TaskOutput, ExecutorError> {
            Ok(double(task))
        }

        async fn execute_batch(&self, items: &[BatchItem]) -> Vec<Result<TaskOutput, ExecutorError>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            items.iter().map(|item| Ok(double(&item.task))).collect()
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        };
        config.batch.window_ms = 50;
        config
    }

    fn engine(registry: ExecutorRegistry) -> Arc<Engine> {
        Arc::new(Engine::new(config(), Arc::new(registry)))
    }

    async fn run(engine: &Arc<Engine>, graph: &Graph) -> RunResult {
        engine
            .orchestrator()
            .run(graph, ContextStore::new(), None)
            .await
            .unwrap()
    }

    // -- scheduling -----------------------------------------------------------

    #[tokio::test]
    async fn test_final_context_independent_of_completion_order() {
        async fn run_with_slow(slow: &str) -> RunResult {
            let journal = Journal::default();
            let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal).delayed(slow, 30)));
            let graph = Graph::new("review")
                .step(Step::sequential("fetch", "echo").output_key("source"))
                .step(
                    Step::parallel(
                        "checks",
                        vec![
                            Step::sequential("analyze", "echo").output_key("summary"),
                            Step::sequential("scan", "echo").output_key("summary"),
                        ],
                    )
                    .after(&["fetch"]),
                )
                .step(
                    Step::sequential("report", "echo")
                        .after(&["checks"])
                        .reads(&["summary"])
                        .output_key("report"),
                );
            run(&engine, &graph).await
        }

        let first = run_with_slow("analyze").await;
        let second = run_with_slow("scan").await;
        assert_eq!(first.overall_status, RunStatus::Succeeded);
        assert_eq!(first.final_context, second.final_context);
        // The earlier-declared member wins the conflicting key.
        assert_eq!(
            first.final_context.read("summary"),
            Some(&json!({ "step": "analyze", "params": null }))
        );
        assert_eq!(first.step("scan").unwrap().parent.as_deref(), Some("checks"));
    }

    #[tokio::test]
    async fn test_sequential_steps_never_overlap() {
        let gauge = Gauge::default();
        let engine = engine(ExecutorRegistry::new().with("work", gauge.clone()));
        let graph = Graph::new("serial")
            .step(Step::sequential("one", "work"))
            .step(Step::sequential("two", "work"))
            .step(Step::sequential("three", "work"));
        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Succeeded);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit_bounds_parallel_members() {
        let gauge = Gauge::default();
        let engine = engine(ExecutorRegistry::new().with("work", gauge.clone()));
        let members = (0..4)
            .map(|i| Step::sequential(format!("m{i}"), "work"))
            .collect();
        let graph = Graph::new("fan-out").step(Step::parallel("group", members));
        let result = engine
            .orchestrator()
            .run(&graph, ContextStore::new(), Some(2))
            .await
            .unwrap();
        assert_eq!(result.overall_status, RunStatus::Succeeded);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_invalid_graph_is_rejected_before_running() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal)));
        let graph = Graph::new("cyclic")
            .step(Step::sequential("a", "echo").after(&["b"]))
            .step(Step::sequential("b", "echo").after(&["a"]));
        let err = engine
            .orchestrator()
            .run(&graph, ContextStore::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Graph(GraphError::Cycle(_))));
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal)));
        let mut events = engine.subscribe();
        let result = run(&engine, &Graph::new("one").step(Step::sequential("only", "echo"))).await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(matches!(received.first(), Some(EngineEvent::RunStarted { .. })));
        assert!(matches!(
            received.last(),
            Some(EngineEvent::RunCompleted { run_id, status: RunStatus::Succeeded, .. }) if *run_id == result.run_id
        ));
        assert!(received.iter().any(|e| matches!(e, EngineEvent::StepCompleted { step_id, .. } if step_id == "only")));
    }

    // -- caching --------------------------------------------------------------

    #[tokio::test]
    async fn test_equal_fingerprints_dispatch_once() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal)));
        let graph = Graph::new("cache")
            .step(Step::sequential("first", "echo").cacheable().with_params(json!({"url": "a"})))
            .step(
                Step::sequential("second", "echo")
                    .cacheable()
                    .with_params(json!({"url": "a"}))
                    .after(&["first"]),
            )
            .step(
                Step::sequential("third", "echo")
                    .cacheable()
                    .with_params(json!({"url": "b"}))
                    .after(&["second"]),
            );

        let result = run(&engine, &graph).await;
        assert_eq!(journal.entries(), vec!["first", "third"]);
        let second = result.step("second").unwrap();
        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(
            result.output_of("second"),
            Some(&json!({ "step": "first", "params": { "url": "a" } }))
        );
    }

    #[tokio::test]
    async fn test_cache_spans_runs_unless_bypassed() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal)));
        let graph = Graph::new("cache").step(Step::sequential("fetch", "echo").cacheable());

        run(&engine, &graph).await;
        run(&engine, &graph).await;
        assert_eq!(journal.entries().len(), 1);

        let options = RunOptions {
            bypass_cache: true,
            ..RunOptions::default()
        };
        engine
            .orchestrator()
            .run_with(&graph, ContextStore::new(), options)
            .await
            .unwrap();
        assert_eq!(journal.entries().len(), 2);
    }

    // -- resilience -----------------------------------------------------------

    #[tokio::test]
    async fn test_transient_member_failure_is_retried() {
        let journal = Journal::default();
        let analysis = Flaky {
            journal: journal.clone(),
            failures_left: AtomicU32::new(2),
        };
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("analysis", analysis),
        );
        let graph = Graph::new("review")
            .step(Step::sequential("fetch", "echo"))
            .step(
                Step::parallel(
                    "checks",
                    vec![
                        Step::sequential("analyze", "analysis"),
                        Step::sequential("scan", "echo"),
                    ],
                )
                .after(&["fetch"]),
            )
            .step(Step::sequential("report", "echo").after(&["checks"]));

        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Succeeded);
        assert_eq!(result.step("analyze").unwrap().attempts, 3);
        assert_eq!(result.status_of("report"), Some(StepStatus::Succeeded));
        assert!(result.error_log.is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_is_reported() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal).delayed("slow", 500)));
        let graph = Graph::new("slow").step(
            Step::sequential("slow", "echo")
                .with_timeout(Duration::from_millis(10))
                .with_retry(RetryConfig::none()),
        );
        let result = run(&engine, &graph).await;
        let slow = result.step("slow").unwrap();
        assert_eq!(slow.status, StepStatus::Failed);
        assert_eq!(slow.error.as_ref().unwrap().kind, "timeout");
        assert_eq!(result.overall_status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_timeout_covers_all_attempts() {
        let engine = engine(ExecutorRegistry::new().with("slow", Sluggish { delay_ms: 40 }));
        let graph = Graph::new("slow").step(
            Step::sequential("slow", "slow")
                .with_timeout(Duration::from_millis(100))
                .with_retry(RetryConfig {
                    max_retries: 3,
                    base_delay_ms: 1,
                    max_delay_ms: 2,
                    jitter: false,
                }),
        );
        let result = run(&engine, &graph).await;
        let slow = result.step("slow").unwrap();
        assert_eq!(slow.status, StepStatus::Failed);
        assert_eq!(slow.error.as_ref().unwrap().kind, "timeout");
        assert!(slow.attempts < 4);
        assert!(slow.duration_ms < 250, "took {}ms", slow.duration_ms);
    }

    #[tokio::test]
    async fn test_panicking_probe_reopens_breaker() {
        let mut config = config();
        config.breaker = BreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 20,
        };
        let registry = ExecutorRegistry::new().with("remote", Relapse::default());
        let engine = Arc::new(Engine::new(config, Arc::new(registry)));
        let graph = Graph::new("remote")
            .step(Step::sequential("call", "remote").with_retry(RetryConfig::none()));
        let capability = Capability::new("remote");

        let first = run(&engine, &graph).await;
        assert_eq!(first.step("call").unwrap().error.as_ref().unwrap().kind, "executor");
        assert_eq!(engine.breakers().state(&capability), CircuitStateKind::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let probe = run(&engine, &graph).await;
        assert_eq!(probe.step("call").unwrap().error.as_ref().unwrap().kind, "panicked");
        assert_eq!(engine.breakers().state(&capability), CircuitStateKind::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let recovered = run(&engine, &graph).await;
        assert_eq!(recovered.overall_status, RunStatus::Succeeded);
        assert_eq!(engine.breakers().state(&capability), CircuitStateKind::Closed);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_then_probes() {
        let journal = Journal::default();
        let healthy = Arc::new(AtomicBool::new(false));
        let mut config = config();
        config.breaker = BreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 50,
        };
        let registry = ExecutorRegistry::new().with(
            "remote",
            Switch {
                journal: journal.clone(),
                healthy: Arc::clone(&healthy),
            },
        );
        let engine = Arc::new(Engine::new(config, Arc::new(registry)));
        let graph = Graph::new("remote").step(Step::sequential("call", "remote"));
        let capability = Capability::new("remote");

        let failed = run(&engine, &graph).await;
        let call = failed.step("call").unwrap();
        // Two real attempts open the breaker; the remaining two fail fast.
        assert_eq!(call.attempts, 4);
        assert_eq!(call.error.as_ref().unwrap().kind, "circuit_open");
        assert_eq!(journal.entries().len(), 2);
        assert_eq!(engine.breakers().state(&capability), CircuitStateKind::Open);
        assert_eq!(failed.overall_status, RunStatus::Failed);

        tokio::time::sleep(Duration::from_millis(80)).await;
        healthy.store(true, Ordering::SeqCst);
        let recovered = run(&engine, &graph).await;
        assert_eq!(recovered.overall_status, RunStatus::Succeeded);
        assert_eq!(journal.entries().len(), 3);
        assert_eq!(engine.breakers().state(&capability), CircuitStateKind::Closed);
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_without_attempts() {
        let engine = engine(ExecutorRegistry::new());
        let result = run(&engine, &Graph::new("missing").step(Step::sequential("a", "nowhere"))).await;
        let a = result.step("a").unwrap();
        assert_eq!(a.attempts, 0);
        assert_eq!(a.error.as_ref().unwrap().kind, "not_found");
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_its_step() {
        let journal = Journal::default();
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("boom", Panicker),
        );
        let graph = Graph::new("panic")
            .step(Step::sequential("explode", "boom").optional())
            .step(Step::sequential("after", "echo"));
        let result = run(&engine, &graph).await;
        assert_eq!(result.step("explode").unwrap().error.as_ref().unwrap().kind, "panicked");
        assert_eq!(result.status_of("after"), Some(StepStatus::Succeeded));
        assert_eq!(result.overall_status, RunStatus::PartiallySucceeded);
    }

    // -- failure handling -----------------------------------------------------

    #[tokio::test]
    async fn test_optional_failure_skips_dependents_only() {
        let journal = Journal::default();
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("broken", Broken),
        );
        let graph = Graph::new("partial")
            .step(Step::sequential("a", "echo"))
            .step(Step::sequential("b", "broken").after(&["a"]).optional())
            .step(Step::sequential("c", "echo").after(&["b"]))
            .step(Step::sequential("d", "echo").after(&["a"]));

        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::PartiallySucceeded);
        assert_eq!(result.status_of("b"), Some(StepStatus::Failed));
        assert_eq!(result.status_of("c"), Some(StepStatus::Skipped));
        assert_eq!(
            result.step("c").unwrap().skip_reason.as_deref(),
            Some("dependency 'b' failed")
        );
        assert_eq!(result.status_of("d"), Some(StepStatus::Succeeded));
        assert_eq!(result.error_log.len(), 1);
        assert!(result.compensation_log.is_empty());
    }

    #[tokio::test]
    async fn test_required_failure_compensates_in_reverse() {
        let journal = Journal::default();
        let undo = Journal::default();
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("broken", Broken)
                .with("undo", Undo { journal: undo.clone() }),
        );
        let graph = Graph::new("saga")
            .step(Step::sequential("a", "echo").compensate_with("undo"))
            .step(Step::sequential("b", "echo").after(&["a"]).compensate_with("undo"))
            .step(Step::sequential("c", "broken").after(&["b"]).compensate_with("undo"));

        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Compensated);
        assert_eq!(undo.entries(), vec!["undo:b", "undo:a"]);
        assert_eq!(result.compensated_steps(), vec!["b", "a"]);
        assert_eq!(result.status_of("a"), Some(StepStatus::Compensated));
        assert_eq!(result.status_of("c"), Some(StepStatus::Failed));
        assert_eq!(result.step("c").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_compensation_fails_the_run() {
        let journal = Journal::default();
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("broken", Broken),
        );
        let graph = Graph::new("saga")
            .step(Step::sequential("a", "echo").compensate_with("broken"))
            .step(Step::sequential("b", "broken").after(&["a"]));

        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Failed);
        assert!(matches!(
            result.compensation_log[0].outcome,
            CompensationOutcome::Failed { .. }
        ));
        assert_eq!(result.status_of("a"), Some(StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_panicking_compensation_does_not_halt_the_walk() {
        let journal = Journal::default();
        let undo = Journal::default();
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("broken", Broken)
                .with("boom", Panicker)
                .with("undo", Undo { journal: undo.clone() }),
        );
        let graph = Graph::new("saga")
            .step(Step::sequential("a", "echo").compensate_with("undo"))
            .step(Step::sequential("b", "echo").after(&["a"]).compensate_with("boom"))
            .step(Step::sequential("c", "broken").after(&["b"]));

        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Failed);
        assert_eq!(result.compensation_log.len(), 2);
        assert_eq!(result.compensation_log[0].step_id, "b");
        assert!(matches!(
            &result.compensation_log[0].outcome,
            CompensationOutcome::Failed { error } if error.contains("panicked")
        ));
        assert_eq!(result.compensation_log[1].outcome, CompensationOutcome::Compensated);
        assert_eq!(undo.entries(), vec!["undo:a"]);
        assert_eq!(result.status_of("b"), Some(StepStatus::Succeeded));
        assert_eq!(result.status_of("a"), Some(StepStatus::Compensated));
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch_and_compensates() {
        let undo = Journal::default();
        let journal = Journal::default();
        let cancel = tokio_util::sync::CancellationToken::new();
        let engine = engine(
            ExecutorRegistry::new()
                .with("echo", Echo::new(&journal))
                .with("cancel", Canceller { token: cancel.clone() })
                .with("undo", Undo { journal: undo.clone() }),
        );
        let graph = Graph::new("cancel")
            .step(Step::sequential("a", "cancel").compensate_with("undo"))
            .step(Step::sequential("b", "echo").after(&["a"]));
        let options = RunOptions {
            cancel,
            ..RunOptions::default()
        };

        let result = engine
            .orchestrator()
            .run_with(&graph, ContextStore::new(), options)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(journal.entries().is_empty());
        assert_eq!(result.step("b").unwrap().skip_reason.as_deref(), Some("run cancelled"));
        assert_eq!(undo.entries(), vec!["undo:a"]);
        assert_eq!(result.overall_status, RunStatus::Compensated);
    }

    // -- conditional, batch, recursive ----------------------------------------

    #[tokio::test]
    async fn test_conditional_skips_unselected_branch() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal)));
        let graph = Graph::new("branch")
            .step(Step::conditional(
                "size_check",
                "size > 10",
                |ctx: &ContextView| Ok(ctx.read("size").and_then(Value::as_u64).unwrap_or(0) > 10),
                &["big"],
                &["small"],
            ))
            .step(Step::sequential("big", "echo").after(&["size_check"]))
            .step(Step::sequential("small", "echo").after(&["size_check"]))
            .step(Step::sequential("report", "echo").after(&["big", "small"]));

        let result = engine
            .orchestrator()
            .run(&graph, ContextStore::from_json(&json!({"size": 20})), None)
            .await
            .unwrap();
        assert_eq!(result.overall_status, RunStatus::Succeeded);
        assert_eq!(journal.entries(), vec!["big", "report"]);
        assert_eq!(result.status_of("small"), Some(StepStatus::Skipped));
        assert_eq!(
            result.step("small").unwrap().skip_reason.as_deref(),
            Some("branch not taken")
        );
        assert_eq!(
            result.output_of("size_check"),
            Some(&json!({ "branch": "then", "selected": ["big"] }))
        );
    }

    #[tokio::test]
    async fn test_batch_steps_share_one_dispatch() {
        let doubler = Doubler::default();
        let engine = engine(ExecutorRegistry::new().with("double", doubler.clone()));
        let graph = Graph::new("batch")
            .step(Step::batch("x1", "double").with_params(json!({"n": 1})))
            .step(Step::batch("x2", "double").with_params(json!({"n": 2})))
            .step(Step::batch("x3", "double").with_params(json!({"n": 3})));

        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Succeeded);
        assert_eq!(result.output_of("x3"), Some(&json!(6)));
        assert_eq!(doubler.batches.load(Ordering::SeqCst), 1);
    }

    /// Re-expands itself with identical input.
    struct Loop;

    impl SubGraphGenerator for Loop {
        fn expand(&self, _ctx: &ContextView, _depth: u32) -> Result<Option<Graph>, GraphError> {
            Ok(Some(Graph::new("loop").step(Step::recursive("again", "expand", Loop))))
        }
    }

    /// Adds one level per depth until depth 3.
    struct Levels;

    impl SubGraphGenerator for Levels {
        fn expand(&self, _ctx: &ContextView, depth: u32) -> Result<Option<Graph>, GraphError> {
            if depth >= 3 {
                return Ok(None);
            }
            Ok(Some(
                Graph::new(format!("level-{depth}"))
                    .step(Step::sequential("work", "echo").output_key(format!("level{depth}")))
                    .step(
                        Step::recursive("deeper", "expand", Levels)
                            .with_params(json!({ "depth": depth }))
                            .after(&["work"]),
                    ),
            ))
        }
    }

    #[tokio::test]
    async fn test_unchanged_recursion_hits_limit() {
        let engine = engine(ExecutorRegistry::new());
        let graph = Graph::new("loop").step(Step::recursive("again", "expand", Loop));
        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Failed);
        assert_eq!(
            result.step("again").unwrap().error.as_ref().unwrap().kind,
            "recursion_limit"
        );
    }

    #[tokio::test]
    async fn test_recursion_bubbles_context_up() {
        let journal = Journal::default();
        let engine = engine(ExecutorRegistry::new().with("echo", Echo::new(&journal)));
        let graph = Graph::new("levels").step(Step::recursive("expand", "expand", Levels));
        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Succeeded);
        assert!(result.final_context.read("level1").is_some());
        assert!(result.final_context.read("level2").is_some());
        assert_eq!(journal.entries().len(), 2);
    }

    /// Never terminates on its own, but its input changes every level.
    struct Endless;

    impl SubGraphGenerator for Endless {
        fn expand(&self, _ctx: &ContextView, depth: u32) -> Result<Option<Graph>, GraphError> {
            Ok(Some(
                Graph::new(format!("endless-{depth}")).step(
                    Step::recursive("deeper", "expand", Endless)
                        .with_params(json!({ "depth": depth }))
                        .max_depth(2),
                ),
            ))
        }
    }

    #[tokio::test]
    async fn test_recursion_depth_cap() {
        let engine = engine(ExecutorRegistry::new());
        let graph = Graph::new("endless").step(Step::recursive("expand", "expand", Endless).max_depth(2));
        let result = run(&engine, &graph).await;
        assert_eq!(result.overall_status, RunStatus::Failed);
        let error = result.step("expand").unwrap().error.clone().unwrap();
        assert_eq!(error.kind, "recursion_limit");
        assert!(error.message.contains("maximum depth 2"));
    }
}
