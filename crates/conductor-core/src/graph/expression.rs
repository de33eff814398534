//! JEXL predicates for conditional steps.
//!
//! Context values are always passed as the evaluation context, never
//! interpolated into expression strings. Top-level context keys are bound as
//! variables, so `risk > 3 && repo|lower == 'core'` reads the `risk` and
//! `repo` keys.

use std::sync::Arc;

use serde_json::{Value, json};

use super::GraphError;
use super::model::Predicate;
use crate::context::ContextView;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

impl From<ExpressionError> for GraphError {
    fn from(err: ExpressionError) -> Self {
        GraphError::Expression(err.to_string())
    }
}

/// JEXL evaluator with the standard transforms registered.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("exists", |args: &[Value]| {
                Ok(json!(!matches!(args.first(), None | Some(Value::Null))))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.evaluate_value(expression, context)?))
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Build a conditional-step predicate from a JEXL expression.
///
/// The evaluator is not thread-safe, so one is built per evaluation.
pub fn expression_predicate(expression: impl Into<String>) -> Predicate {
    let expression = expression.into();
    Arc::new(move |view: &ContextView| {
        WorkflowEvaluator::new()
            .evaluate_bool(&expression, &view.to_json())
            .map_err(GraphError::from)
    })
}
