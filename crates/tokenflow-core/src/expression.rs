//! Sequence-flow condition evaluation.
//!
//! Conditions are JEXL expressions evaluated against the variables visible
//! from the execution leaving the node (`amount > 100`,
//! `region|lower == 'eu'`). The engine talks to the evaluator through the
//! `ConditionEvaluator` trait so embedders can plug in another language.
//!
//! Variables are always passed as the context object, never interpolated
//! into the expression string.

use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("empty expression")]
    Empty,
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Decides whether a conditional sequence flow may be taken.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &Map<String, Value>)
    -> Result<bool, ExpressionError>;
}

/// JEXL evaluator with a few string and collection transforms registered.
///
/// `jexl_eval::Evaluator` holds boxed non-`Send` closures, so a fresh
/// evaluator is assembled for every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct JexlConditionEvaluator;

impl JexlConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn evaluator() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
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
                    (Some(Value::String(subject)), Some(Value::String(search))) => {
                        subject.contains(search.as_str())
                    }
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
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
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if expression.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }
        Self::evaluator()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// JavaScript-like truthiness.
    fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl ConditionEvaluator for JexlConditionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        let context = Value::Object(variables.clone());
        let result = self.evaluate_value(expression, &context)?;
        Ok(Self::value_to_bool(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn numeric_comparisons() {
        let eval = JexlConditionEvaluator::new();
        let v = vars(json!({ "x": 5 }));
        assert!(!eval.evaluate("x > 10", &v).unwrap());
        assert!(eval.evaluate("x <= 10", &v).unwrap());
        assert!(eval.evaluate("x == 5", &v).unwrap());
    }

    #[test]
    fn string_transforms() {
        let eval = JexlConditionEvaluator::new();
        let v = vars(json!({ "region": "EU", "tags": ["vip", "new"] }));
        assert!(eval.evaluate("region|lower == 'eu'", &v).unwrap());
        assert!(eval.evaluate("tags|contains('vip')", &v).unwrap());
        assert!(eval.evaluate("tags|length == 2", &v).unwrap());
    }

    #[test]
    fn truthiness_of_non_boolean_results() {
        let eval = JexlConditionEvaluator::new();
        let v = vars(json!({ "name": "", "count": 3 }));
        assert!(!eval.evaluate("name", &v).unwrap());
        assert!(eval.evaluate("count", &v).unwrap());
    }

    #[test]
    fn empty_and_invalid_expressions_fail() {
        let eval = JexlConditionEvaluator::new();
        let v = Map::new();
        assert!(matches!(eval.evaluate("  ", &v), Err(ExpressionError::Empty)));
        assert!(matches!(
            eval.evaluate("x >", &v),
            Err(ExpressionError::EvalFailed(_))
        ));
    }
}
