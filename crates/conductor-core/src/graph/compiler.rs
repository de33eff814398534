//! Compiles declarative workflow definitions into executable graphs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conductor_types::task::Capability;
use conductor_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};

use super::GraphError;
use super::dag::validate;
use super::expression::expression_predicate;
use super::model::{Graph, Step, StepAction, SubGraphGenerator};

/// Turns a `WorkflowDefinition` into a validated `Graph`.
///
/// Conditional steps become JEXL predicates. Recursive steps name a
/// generator, which must be registered on the compiler beforehand: sub-graph
/// construction is code, not data.
#[derive(Default, Clone)]
pub struct GraphCompiler {
    generators: HashMap<String, Arc<dyn SubGraphGenerator>>,
}

impl GraphCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_generator<G>(&mut self, name: impl Into<String>, generator: G)
    where
        G: SubGraphGenerator + 'static,
    {
        self.generators.insert(name.into(), Arc::new(generator));
    }

    pub fn with_generator<G>(mut self, name: impl Into<String>, generator: G) -> Self
    where
        G: SubGraphGenerator + 'static,
    {
        self.register_generator(name, generator);
        self
    }

    pub fn compile(&self, definition: &WorkflowDefinition) -> Result<Graph, GraphError> {
        let mut graph = Graph::new(definition.name.clone());
        if let Some(limit) = definition.concurrency {
            graph = graph.with_concurrency(limit);
        }
        for step in &definition.steps {
            graph = graph.step(self.compile_step(step)?);
        }
        validate(&graph)?;
        tracing::debug!(
            workflow = %definition.name,
            steps = graph.len(),
            "workflow compiled"
        );
        Ok(graph)
    }

    fn compile_step(&self, def: &StepDefinition) -> Result<Step, GraphError> {
        let action = match &def.config {
            StepConfig::Sequential { capability } => StepAction::Sequential {
                capability: capability_of(def, capability)?,
            },
            StepConfig::Batch { capability } => StepAction::Batch {
                capability: capability_of(def, capability)?,
            },
            StepConfig::Parallel { members } => StepAction::Parallel {
                members: members
                    .iter()
                    .map(|m| self.compile_step(m))
                    .collect::<Result<Vec<_>, _>>()?,
            },
            StepConfig::Conditional {
                condition,
                then_steps,
                else_steps,
            } => StepAction::Conditional {
                expression: condition.clone(),
                predicate: expression_predicate(condition.clone()),
                then_steps: then_steps.clone(),
                else_steps: else_steps.clone(),
            },
            StepConfig::Recursive {
                capability,
                generator,
                max_depth,
            } => StepAction::Recursive {
                capability: capability_of(def, capability)?,
                generator: self.generators.get(generator).cloned().ok_or_else(|| {
                    GraphError::validation(&def.id, format!("unknown generator '{generator}'"))
                })?,
                max_depth: *max_depth,
            },
        };

        let deps: Vec<&str> = def.depends_on.iter().map(String::as_str).collect();
        let mut step = Step::with_action(def.id.clone(), action)
            .after(&deps)
            .with_params(def.params.clone());
        step.required = def.required;
        step.cacheable = def.cacheable;
        step.retry = def.retry.clone();
        step.timeout = def.timeout_ms.map(Duration::from_millis);
        step.reads = def.reads.clone();
        step.output_key = def.output_key.clone();
        step.compensation = def.compensation.clone().map(Capability::from);
        Ok(step)
    }
}

impl std::fmt::Debug for GraphCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.generators.keys().collect();
        names.sort();
        f.debug_struct("GraphCompiler").field("generators", &names).finish()
    }
}

fn capability_of(def: &StepDefinition, name: &str) -> Result<Capability, GraphError> {
    if name.trim().is_empty() {
        return Err(GraphError::validation(&def.id, "capability must not be empty"));
    }
    Ok(Capability::new(name))
}
