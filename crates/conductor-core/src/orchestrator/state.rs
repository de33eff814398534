//! Per-run bookkeeping owned by the scheduler loop.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use conductor_types::task::{Proposal, TaskOutput};
use conductor_types::workflow::StepStatus;

use super::result::{StepErrorRecord, StepResult};
use crate::context::{ContextStore, ContextView};
use crate::error::StepError;
use crate::graph::{Graph, Step, transitive_dependencies};

/// What a dispatched step reports back to the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<TaskOutput>,
    pub error: Option<StepError>,
    pub attempts: u32,
    pub cached: bool,
    pub duration: Duration,
    pub skip_reason: Option<String>,
    /// Outcomes of parallel members, in declaration order.
    pub members: Vec<StepOutcome>,
}

impl StepOutcome {
    pub fn succeeded(step: &Step, output: TaskOutput, attempts: u32, cached: bool, duration: Duration) -> Self {
        Self {
            step_id: step.id.clone(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            attempts,
            cached,
            duration,
            skip_reason: None,
            members: Vec::new(),
        }
    }

    pub fn failed(step: &Step, error: StepError, attempts: u32, duration: Duration) -> Self {
        Self {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
            cached: false,
            duration,
            skip_reason: None,
            members: Vec::new(),
        }
    }

    pub fn skipped(step_id: &str, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            attempts: 0,
            cached: false,
            duration: Duration::ZERO,
            skip_reason: Some(reason.into()),
            members: Vec::new(),
        }
    }

    pub fn with_members(mut self, members: Vec<StepOutcome>) -> Self {
        self.members = members;
        self
    }
}

/// Status and outcome of every step of one run, parallel members included.
#[derive(Debug, Default)]
pub(crate) struct ExecutionState {
    statuses: HashMap<String, StepStatus>,
    outcomes: HashMap<String, StepOutcome>,
}

impl ExecutionState {
    pub fn new(graph: &Graph) -> Self {
        let mut statuses = HashMap::new();
        for step in graph.steps() {
            statuses.insert(step.id.clone(), StepStatus::Pending);
            for member in step.members() {
                statuses.insert(member.id.clone(), StepStatus::Pending);
            }
        }
        Self {
            statuses,
            outcomes: HashMap::new(),
        }
    }

    pub fn status(&self, step_id: &str) -> StepStatus {
        self.statuses
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    pub fn set_running(&mut self, step: &Step) {
        self.statuses.insert(step.id.clone(), StepStatus::Running);
        for member in step.members() {
            self.statuses.insert(member.id.clone(), StepStatus::Running);
        }
    }

    /// Store an outcome, flattening parallel members into their own entries.
    pub fn record(&mut self, mut outcome: StepOutcome) {
        for member in std::mem::take(&mut outcome.members) {
            self.record(member);
        }
        self.statuses.insert(outcome.step_id.clone(), outcome.status);
        self.outcomes.insert(outcome.step_id.clone(), outcome);
    }

    /// Skip a step that never ran, and its members.
    pub fn skip(&mut self, step: &Step, reason: &str) {
        for member in step.members() {
            self.record(StepOutcome::skipped(&member.id, reason));
        }
        self.record(StepOutcome::skipped(&step.id, reason));
    }

    pub fn mark_compensated(&mut self, step_id: &str) {
        self.statuses.insert(step_id.to_string(), StepStatus::Compensated);
    }

    pub fn output(&self, step_id: &str) -> Option<&TaskOutput> {
        self.outcomes.get(step_id).and_then(|o| o.output.as_ref())
    }

    fn proposals(&self, step_id: &str) -> &[Proposal] {
        self.output(step_id)
            .map(|o| o.proposals.as_slice())
            .unwrap_or(&[])
    }

    pub fn any_with_status(&self, status: StepStatus) -> bool {
        self.statuses.values().any(|s| *s == status)
    }

    /// Whether any step stopped because the run was cancelled.
    pub fn any_cancelled(&self) -> bool {
        self.outcomes.values().any(|o| {
            o.error
                .as_ref()
                .is_some_and(|e| matches!(e.root(), StepError::Cancelled))
        })
    }

    /// Context visible to `step_id`: the initial context plus the merges of
    /// its transitive dependencies, applied in topological order.
    pub fn view_for(&self, graph: &Graph, initial: &ContextStore, order: &[String], step_id: &str) -> ContextView {
        let ancestors = transitive_dependencies(graph, step_id);
        let mut ctx = initial.clone();
        for id in order.iter().filter(|id| ancestors.contains(id.as_str())) {
            if self.status(id) == StepStatus::Succeeded {
                ctx.merge(id, self.proposals(id));
            }
        }
        ctx.view()
    }

    /// The run's context: every completed step's proposals merged in
    /// topological order, independent of completion order.
    pub fn final_context(&self, initial: &ContextStore, order: &[String]) -> ContextStore {
        let mut ctx = initial.clone();
        for id in order {
            if matches!(self.status(id), StepStatus::Succeeded | StepStatus::Compensated) {
                ctx.merge(id, self.proposals(id));
            }
        }
        ctx
    }

    /// Failures in topological order, members right after their group.
    pub fn error_log(&self, graph: &Graph, order: &[String]) -> Vec<StepErrorRecord> {
        let mut log = Vec::new();
        for step in ordered_steps(graph, order) {
            if let Some(outcome) = self.outcomes.get(&step.id) {
                if let Some(error) = &outcome.error {
                    log.push(StepErrorRecord::new(
                        &step.id,
                        step.capability(),
                        error,
                        outcome.attempts,
                    ));
                }
            }
        }
        log
    }

    pub fn step_results(&self, graph: &Graph) -> BTreeMap<String, StepResult> {
        let mut results = BTreeMap::new();
        for step in graph.steps() {
            results.insert(step.id.clone(), self.step_result(step, None));
            for member in step.members() {
                results.insert(member.id.clone(), self.step_result(member, Some(&step.id)));
            }
        }
        results
    }

    fn step_result(&self, step: &Step, parent: Option<&str>) -> StepResult {
        let outcome = self.outcomes.get(&step.id);
        StepResult {
            step_id: step.id.clone(),
            kind: step.kind(),
            capability: step.capability().cloned(),
            parent: parent.map(str::to_string),
            required: step.required,
            status: self.status(&step.id),
            attempts: outcome.map(|o| o.attempts).unwrap_or(0),
            cached: outcome.map(|o| o.cached).unwrap_or(false),
            output: outcome
                .and_then(|o| o.output.as_ref())
                .map(|o| o.value.clone()),
            error: outcome.and_then(|o| {
                o.error
                    .as_ref()
                    .map(|e| StepErrorRecord::new(&step.id, step.capability(), e, o.attempts))
            }),
            skip_reason: outcome.and_then(|o| o.skip_reason.clone()),
            duration_ms: outcome
                .map(|o| o.duration.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// Top-level steps in `order`, each followed by its parallel members.
pub(crate) fn ordered_steps<'a>(graph: &'a Graph, order: &'a [String]) -> impl Iterator<Item = &'a Step> {
    order
        .iter()
        .filter_map(|id| graph.get(id))
        .flat_map(|step| std::iter::once(step).chain(step.members().iter()))
}
