//! Graph and step model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use conductor_types::task::Capability;
use conductor_types::workflow::{RetryConfig, StepKind};

use super::GraphError;
use crate::context::ContextView;

/// Branch selector of a conditional step.
pub type Predicate = Arc<dyn Fn(&ContextView) -> Result<bool, GraphError> + Send + Sync>;

/// Produces the sub-graph of a recursive step at execution time.
///
/// `depth` is the nesting level the sub-graph will run at (1 for the first
/// expansion). Returning `Ok(None)` ends the recursion.
pub trait SubGraphGenerator: Send + Sync {
    fn expand(&self, ctx: &ContextView, depth: u32) -> Result<Option<Graph>, GraphError>;
}

impl<F> SubGraphGenerator for F
where
    F: Fn(&ContextView, u32) -> Result<Option<Graph>, GraphError> + Send + Sync,
{
    fn expand(&self, ctx: &ContextView, depth: u32) -> Result<Option<Graph>, GraphError> {
        self(ctx, depth)
    }
}

/// What a step does when it runs.
#[derive(Clone)]
pub enum StepAction {
    /// Invoke one capability directly. Runs with nothing else in flight.
    Sequential { capability: Capability },
    /// Invoke one capability through the batch aggregator.
    Batch { capability: Capability },
    /// Run member steps concurrently and join.
    Parallel { members: Vec<Step> },
    /// Select a branch; the unselected branch's steps are skipped.
    Conditional {
        expression: String,
        predicate: Predicate,
        then_steps: Vec<String>,
        else_steps: Vec<String>,
    },
    /// Expand and run a nested graph.
    Recursive {
        capability: Capability,
        generator: Arc<dyn SubGraphGenerator>,
        max_depth: Option<u32>,
    },
}

impl std::fmt::Debug for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Sequential { capability } => {
                f.debug_struct("Sequential").field("capability", capability).finish()
            }
            StepAction::Batch { capability } => {
                f.debug_struct("Batch").field("capability", capability).finish()
            }
            StepAction::Parallel { members } => {
                f.debug_struct("Parallel").field("members", members).finish()
            }
            StepAction::Conditional {
                expression,
                then_steps,
                else_steps,
                ..
            } => f
                .debug_struct("Conditional")
                .field("expression", expression)
                .field("then_steps", then_steps)
                .field("else_steps", else_steps)
                .finish_non_exhaustive(),
            StepAction::Recursive {
                capability,
                max_depth,
                ..
            } => f
                .debug_struct("Recursive")
                .field("capability", capability)
                .field("max_depth", max_depth)
                .finish_non_exhaustive(),
        }
    }
}

/// A node of the workflow graph.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub action: StepAction,
    pub depends_on: Vec<String>,
    /// A failed required step halts the run and triggers compensation.
    pub required: bool,
    pub cacheable: bool,
    /// Overrides the engine's default retry policy.
    pub retry: Option<RetryConfig>,
    /// Step timeout over all attempts; the engine default applies when `None`.
    pub timeout: Option<Duration>,
    pub params: Value,
    /// Context keys copied into the task input.
    pub reads: Vec<String>,
    /// Publish the output value under this context key.
    pub output_key: Option<String>,
    /// Capability invoked to undo this step.
    pub compensation: Option<Capability>,
}

impl Step {
    /// A required, non-cacheable step with no dependencies.
    pub fn with_action(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
            depends_on: Vec::new(),
            required: true,
            cacheable: false,
            retry: None,
            timeout: None,
            params: Value::Null,
            reads: Vec::new(),
            output_key: None,
            compensation: None,
        }
    }

    pub fn sequential(id: impl Into<String>, capability: impl Into<Capability>) -> Self {
        Self::with_action(
            id,
            StepAction::Sequential {
                capability: capability.into(),
            },
        )
    }

    pub fn batch(id: impl Into<String>, capability: impl Into<Capability>) -> Self {
        Self::with_action(
            id,
            StepAction::Batch {
                capability: capability.into(),
            },
        )
    }

    pub fn parallel(id: impl Into<String>, members: Vec<Step>) -> Self {
        Self::with_action(id, StepAction::Parallel { members })
    }

    pub fn conditional<P>(
        id: impl Into<String>,
        expression: impl Into<String>,
        predicate: P,
        then_steps: &[&str],
        else_steps: &[&str],
    ) -> Self
    where
        P: Fn(&ContextView) -> Result<bool, GraphError> + Send + Sync + 'static,
    {
        Self::with_action(
            id,
            StepAction::Conditional {
                expression: expression.into(),
                predicate: Arc::new(predicate),
                then_steps: then_steps.iter().map(|s| s.to_string()).collect(),
                else_steps: else_steps.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn recursive<G>(id: impl Into<String>, capability: impl Into<Capability>, generator: G) -> Self
    where
        G: SubGraphGenerator + 'static,
    {
        Self::with_action(
            id,
            StepAction::Recursive {
                capability: capability.into(),
                generator: Arc::new(generator),
                max_depth: None,
            },
        )
    }

    // -- builder helpers ----------------------------------------------------

    /// Add dependencies, ignoring duplicates.
    pub fn after(mut self, deps: &[&str]) -> Self {
        for dep in deps {
            if !self.depends_on.iter().any(|d| d == dep) {
                self.depends_on.push(dep.to_string());
            }
        }
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn reads(mut self, keys: &[&str]) -> Self {
        self.reads.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn compensate_with(mut self, capability: impl Into<Capability>) -> Self {
        self.compensation = Some(capability.into());
        self
    }

    /// Cap the nesting depth of a recursive step.
    pub fn max_depth(mut self, depth: u32) -> Self {
        if let StepAction::Recursive { max_depth, .. } = &mut self.action {
            *max_depth = Some(depth);
        }
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn kind(&self) -> StepKind {
        match self.action {
            StepAction::Sequential { .. } => StepKind::Sequential,
            StepAction::Batch { .. } => StepKind::Batch,
            StepAction::Parallel { .. } => StepKind::Parallel,
            StepAction::Conditional { .. } => StepKind::Conditional,
            StepAction::Recursive { .. } => StepKind::Recursive,
        }
    }

    pub fn capability(&self) -> Option<&Capability> {
        match &self.action {
            StepAction::Sequential { capability }
            | StepAction::Batch { capability }
            | StepAction::Recursive { capability, .. } => Some(capability),
            StepAction::Parallel { .. } | StepAction::Conditional { .. } => None,
        }
    }

    pub fn members(&self) -> &[Step] {
        match &self.action {
            StepAction::Parallel { members } => members,
            _ => &[],
        }
    }
}

/// An immutable workflow graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    steps: Vec<Step>,
    concurrency: Option<usize>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            concurrency: None,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
