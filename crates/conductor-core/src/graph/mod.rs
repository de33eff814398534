//! Workflow graphs.
//!
//! A `Graph` is an immutable list of `Step`s whose `depends_on` edges form a
//! DAG. Graphs are built in code or compiled from a `WorkflowDefinition`,
//! validated before execution, and scheduled by the orchestrator.

pub mod compiler;
pub mod dag;
pub mod expression;
pub mod model;
pub mod recursion;

pub use compiler::GraphCompiler;
pub use dag::{topological_order, transitive_dependencies, validate};
pub use expression::{ExpressionError, WorkflowEvaluator, expression_predicate};
pub use model::{Graph, Predicate, Step, StepAction, SubGraphGenerator};
pub use recursion::RecursionGuard;

/// Errors raised while building, validating or expanding a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("cycle detected involving step '{0}'")]
    Cycle(String),

    #[error("step '{step}' depends on unknown step '{missing}'")]
    DanglingDependency { step: String, missing: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("invalid step '{step}': {reason}")]
    Validation { step: String, reason: String },

    #[error("recursion limit reached at depth {depth}: {reason}")]
    RecursionLimit { depth: u32, reason: String },

    #[error("expression error: {0}")]
    Expression(String),
}

impl GraphError {
    pub(crate) fn validation(step: &str, reason: impl Into<String>) -> Self {
        GraphError::Validation {
            step: step.to_string(),
            reason: reason.into(),
        }
    }
}
