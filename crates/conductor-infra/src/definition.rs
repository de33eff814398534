//! YAML workflow definitions.
//!
//! Converts between YAML files and `WorkflowDefinition`, checks the
//! structural constraints that serde cannot express, and compiles a
//! definition into an executable `Graph`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use conductor_core::graph::{Graph, GraphCompiler, GraphError};
use conductor_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML workflow definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, `-` and `_`
/// - At least one step exists
/// - Step IDs are unique across the workflow, parallel members included
/// - Parallel groups have members, and members declare no dependencies
/// - `depends_on` and conditional branch references name top-level steps
/// - Concurrency, timeouts and recursion caps are positive when set
///
/// Cycles are left to the graph compiler.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "workflow name '{}' contains invalid characters",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    if def.concurrency == Some(0) {
        return Err(DefinitionError::Validation(
            "concurrency must be >= 1".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        collect_ids(step, &mut seen)?;
    }

    let top_level: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &def.steps {
        for dep in &step.depends_on {
            if !top_level.contains(dep.as_str()) {
                return Err(DefinitionError::Validation(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                )));
            }
        }
        if let StepConfig::Conditional {
            then_steps,
            else_steps,
            ..
        } = &step.config
        {
            for target in then_steps.iter().chain(else_steps) {
                if !top_level.contains(target.as_str()) {
                    return Err(DefinitionError::Validation(format!(
                        "conditional step '{}' references unknown step '{target}'",
                        step.id
                    )));
                }
            }
        }
    }

    Ok(())
}

fn collect_ids<'a>(
    step: &'a StepDefinition,
    seen: &mut HashSet<&'a str>,
) -> Result<(), DefinitionError> {
    if step.id.trim().is_empty() {
        return Err(DefinitionError::Validation(
            "step id must not be empty".to_string(),
        ));
    }
    if !seen.insert(step.id.as_str()) {
        return Err(DefinitionError::Validation(format!(
            "duplicate step ID: '{}'",
            step.id
        )));
    }
    if step.timeout_ms == Some(0) {
        return Err(DefinitionError::Validation(format!(
            "step '{}': timeout must be > 0",
            step.id
        )));
    }

    match &step.config {
        StepConfig::Parallel { members } => {
            if members.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "parallel step '{}' has no members",
                    step.id
                )));
            }
            for member in members {
                if !member.depends_on.is_empty() {
                    return Err(DefinitionError::Validation(format!(
                        "member '{}' of '{}' must not declare dependencies",
                        member.id, step.id
                    )));
                }
                collect_ids(member, seen)?;
            }
        }
        StepConfig::Recursive {
            max_depth: Some(0), ..
        } => {
            return Err(DefinitionError::Validation(format!(
                "recursive step '{}': max_depth must be >= 1",
                step.id
            )));
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Validate a definition and compile it into a graph.
pub fn compile_definition(
    def: &WorkflowDefinition,
    compiler: &GraphCompiler,
) -> Result<Graph, DefinitionError> {
    validate_definition(def)?;
    Ok(compiler.compile(def)?)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

pub async fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_workflow_yaml(&content)
}

/// Save a definition as YAML, creating parent directories as needed.
pub async fn save_workflow_file(
    path: &Path,
    def: &WorkflowDefinition,
) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    tokio::fs::write(path, yaml).await?;
    Ok(())
}

/// Load every `.yaml`/`.yml` definition directly under `dir`, sorted by path.
///
/// Files that fail to parse or validate are logged and skipped.
pub async fn discover_workflows(
    dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow_file(&path).await {
            Ok(def) => results.push((path, def)),
            Err(err) => tracing::warn!(path = %path.display(), %err, "skipping workflow file"),
        }
    }

    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::context::ContextView;
    use conductor_types::workflow::StepKind;
    use tempfile::TempDir;

    const REVIEW: &str = r#"
name: code-review
concurrency: 2
steps:
  - id: fetch
    cacheable: true
    output_key: source
    config: { type: sequential, capability: fetch }
  - id: checks
    depends_on: [fetch]
    config:
      type: parallel
      members:
        - id: analyze
          config: { type: sequential, capability: analysis }
        - id: scan
          required: false
          retry: { max_retries: 1, jitter: false }
          config: { type: batch, capability: scan }
  - id: gate
    depends_on: [checks]
    config:
      type: conditional
      condition: "source != null"
      then_steps: [report]
  - id: report
    depends_on: [gate]
    reads: [source]
    compensation: retract
    config: { type: sequential, capability: report }
"#;

    #[test]
    fn parse_valid_workflow() {
        let def = parse_workflow_yaml(REVIEW).unwrap();
        assert_eq!(def.name, "code-review");
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.steps[2].config.kind(), StepKind::Conditional);
    }

    #[test]
    fn parse_invalid_yaml_is_parse_error() {
        let err = parse_workflow_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn duplicate_member_id_rejected() {
        let yaml = r#"
name: dup
steps:
  - id: a
    config: { type: sequential, capability: a }
  - id: group
    config:
      type: parallel
      members:
        - id: a
          config: { type: sequential, capability: a }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID: 'a'"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let yaml = r#"
name: dangling
steps:
  - id: a
    depends_on: [ghost]
    config: { type: sequential, capability: a }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn conditional_target_must_exist() {
        let yaml = r#"
name: gate
steps:
  - id: gate
    config: { type: conditional, condition: "true", then_steps: [nowhere] }
"#;
        assert!(matches!(
            parse_workflow_yaml(yaml),
            Err(DefinitionError::Validation(_))
        ));
    }

    #[test]
    fn member_dependencies_rejected() {
        let yaml = r#"
name: members
steps:
  - id: a
    config: { type: sequential, capability: a }
  - id: group
    config:
      type: parallel
      members:
        - id: b
          depends_on: [a]
          config: { type: sequential, capability: b }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("must not declare dependencies"));
    }

    #[test]
    fn zero_limits_rejected() {
        let zero_concurrency = r#"
name: z
concurrency: 0
steps:
  - id: a
    config: { type: sequential, capability: a }
"#;
        assert!(parse_workflow_yaml(zero_concurrency).is_err());

        let zero_depth = r#"
name: z
steps:
  - id: walk
    config: { type: recursive, capability: walk, generator: tree, max_depth: 0 }
"#;
        assert!(parse_workflow_yaml(zero_depth).is_err());
    }

    #[test]
    fn bad_name_rejected() {
        let yaml = r#"
name: "has spaces"
steps:
  - id: a
    config: { type: sequential, capability: a }
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn compile_reports_cycles_from_graph_validation() {
        let yaml = r#"
name: cyclic
steps:
  - id: a
    depends_on: [b]
    config: { type: sequential, capability: a }
  - id: b
    depends_on: [a]
    config: { type: sequential, capability: b }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        let err = compile_definition(&def, &GraphCompiler::new()).unwrap_err();
        assert!(matches!(err, DefinitionError::Graph(GraphError::Cycle(_))));
    }

    #[test]
    fn compile_resolves_registered_generator() {
        let yaml = r#"
name: tree-walk
steps:
  - id: walk
    config: { type: recursive, capability: walk, generator: tree, max_depth: 3 }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        let compiler = GraphCompiler::new().with_generator(
            "tree",
            |_: &ContextView, _: u32| -> Result<Option<Graph>, GraphError> { Ok(None) },
        );
        let graph = compile_definition(&def, &compiler).unwrap();
        assert_eq!(graph.get("walk").unwrap().kind(), StepKind::Recursive);
    }

    #[tokio::test]
    async fn save_and_load_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("review.yaml");
        let def = parse_workflow_yaml(REVIEW).unwrap();

        save_workflow_file(&path, &def).await.unwrap();
        let loaded = load_workflow_file(&path).await.unwrap();

        assert_eq!(loaded.name, def.name);
        assert_eq!(loaded.steps.len(), def.steps.len());
        let graph = compile_definition(&loaded, &GraphCompiler::new()).unwrap();
        assert_eq!(graph.get("report").unwrap().reads, vec!["source"]);
    }

    #[tokio::test]
    async fn discover_skips_invalid_files() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("b-review.yaml"), REVIEW).await.unwrap();
        tokio::fs::write(tmp.path().join("a-broken.yml"), "name: [").await.unwrap();
        tokio::fs::write(tmp.path().join("notes.txt"), "ignored").await.unwrap();

        let found = discover_workflows(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "code-review");

        let missing = discover_workflows(&tmp.path().join("absent")).await.unwrap();
        assert!(missing.is_empty());
    }
}
