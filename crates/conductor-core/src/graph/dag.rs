//! Structural validation and deterministic ordering.
//!
//! `validate` rejects malformed graphs before anything runs. Cycle detection
//! uses `petgraph::algo::toposort`; the scheduling order itself comes from
//! `topological_order`, a Kahn's-algorithm sort that breaks ties by
//! declaration order so every run of a graph sees the same order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::GraphError;
use super::model::{Graph, Step, StepAction};

/// Check a graph for structural errors.
///
/// - step IDs are non-empty and unique, parallel members included
/// - every dependency names a top-level step of the graph
/// - parallel members are non-empty leaf steps without dependencies
/// - conditional branch targets exist and depend on their conditional
/// - the dependency relation is acyclic
pub fn validate(graph: &Graph) -> Result<(), GraphError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in graph.steps() {
        register_id(&mut seen, step)?;
        match &step.action {
            StepAction::Parallel { members } => {
                if members.is_empty() {
                    return Err(GraphError::validation(&step.id, "parallel group has no members"));
                }
                for member in members {
                    register_id(&mut seen, member)?;
                    if !member.depends_on.is_empty() {
                        return Err(GraphError::validation(
                            &member.id,
                            "parallel members cannot declare dependencies",
                        ));
                    }
                    if !matches!(
                        member.action,
                        StepAction::Sequential { .. } | StepAction::Batch { .. }
                    ) {
                        return Err(GraphError::validation(
                            &member.id,
                            "parallel members must be sequential or batch steps",
                        ));
                    }
                }
            }
            StepAction::Recursive {
                max_depth: Some(0), ..
            } => {
                return Err(GraphError::validation(&step.id, "max_depth must be at least 1"));
            }
            _ => {}
        }
    }

    let top_level: HashSet<&str> = graph.steps().iter().map(|s| s.id.as_str()).collect();
    for step in graph.steps() {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(GraphError::Cycle(step.id.clone()));
            }
            if !top_level.contains(dep.as_str()) {
                return Err(GraphError::DanglingDependency {
                    step: step.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    for step in graph.steps() {
        if let StepAction::Conditional {
            then_steps,
            else_steps,
            ..
        } = &step.action
        {
            validate_branches(graph, step, then_steps, else_steps)?;
        }
    }

    detect_cycle(graph)
}

fn register_id<'a>(seen: &mut HashSet<&'a str>, step: &'a Step) -> Result<(), GraphError> {
    if step.id.trim().is_empty() {
        return Err(GraphError::validation(&step.id, "step id must not be empty"));
    }
    if !seen.insert(step.id.as_str()) {
        return Err(GraphError::DuplicateStep(step.id.clone()));
    }
    Ok(())
}

fn validate_branches(
    graph: &Graph,
    conditional: &Step,
    then_steps: &[String],
    else_steps: &[String],
) -> Result<(), GraphError> {
    for target in then_steps.iter().chain(else_steps) {
        let Some(step) = graph.get(target) else {
            return Err(GraphError::validation(
                &conditional.id,
                format!("branch target '{target}' is not a step of the graph"),
            ));
        };
        if !step.depends_on.contains(&conditional.id) {
            return Err(GraphError::validation(
                target,
                format!("branch target must depend on conditional '{}'", conditional.id),
            ));
        }
    }
    if let Some(both) = then_steps.iter().find(|t| else_steps.contains(t)) {
        return Err(GraphError::validation(
            &conditional.id,
            format!("step '{both}' appears in both branches"),
        ));
    }
    Ok(())
}

fn detect_cycle(graph: &Graph) -> Result<(), GraphError> {
    let mut dag = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = graph
        .steps()
        .iter()
        .map(|s| (s.id.as_str(), dag.add_node(s.id.as_str())))
        .collect();
    for step in graph.steps() {
        for dep in &step.depends_on {
            if let (Some(from), Some(to)) = (nodes.get(dep.as_str()), nodes.get(step.id.as_str())) {
                dag.add_edge(*from, *to, ());
            }
        }
    }
    toposort(&dag, None)
        .map(|_| ())
        .map_err(|cycle| GraphError::Cycle(dag[cycle.node_id()].to_string()))
}

/// Top-level step IDs in a deterministic topological order.
///
/// Among steps whose dependencies are all placed, the earliest declared one
/// comes first.
pub fn topological_order(graph: &Graph) -> Result<Vec<String>, GraphError> {
    let steps = graph.steps();
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(GraphError::DanglingDependency {
                    step: step.id.clone(),
                    missing: dep.clone(),
                });
            };
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(steps[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < steps.len() {
        let stuck = steps
            .iter()
            .enumerate()
            .find(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.id.clone())
            .unwrap_or_default();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}

/// Every step `step_id` depends on, directly or transitively.
pub fn transitive_dependencies(graph: &Graph, step_id: &str) -> HashSet<String> {
    let mut found = HashSet::new();
    let mut stack: Vec<&str> = graph
        .get(step_id)
        .map(|s| s.depends_on.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if found.insert(id.to_string()) {
            if let Some(step) = graph.get(id) {
                stack.extend(step.depends_on.iter().map(String::as_str));
            }
        }
    }
    found
}
