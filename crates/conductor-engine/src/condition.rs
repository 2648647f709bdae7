//! Condition evaluation and conditional routing.
//!
//! A condition names a dotted field path into the run state:
//!
//! - `parameters.<name>[.<key>...]`: a run parameter
//! - `outputs.<step>[.<key>...]`: a step output (parsed as JSON when possible)
//! - `metadata.<step>.<field>`: a field derived from a step's output
//! - `<step>[.<key>...]`: shorthand for a step output, falling back to its
//!   metadata, then to a parameter of that name
//!
//! A path that does not resolve never matches, whatever the operator.

use std::cmp::Ordering;

use serde_json::Value;
use tracing::debug;

use conductor_core::template::{Condition, ConditionalEdge, Operator};
use conductor_core::types::value_to_text;

use crate::metadata::parse_json_block;
use crate::state::RunState;

/// Pick the target of a conditional edge: the first matching condition's
/// target, else the edge default.
pub fn route<'a>(edge: &'a ConditionalEdge, state: &RunState) -> &'a str {
    for condition in &edge.conditions {
        if evaluate(condition, state) {
            debug!(
                from = %edge.from_step,
                field = %condition.field,
                route = %condition.target,
                "Condition matched"
            );
            return &condition.target;
        }
    }
    debug!(from = %edge.from_step, route = %edge.default, "No condition matched, using default");
    &edge.default
}

/// Evaluate one condition against the run state.
pub fn evaluate(condition: &Condition, state: &RunState) -> bool {
    match resolve_field(state, &condition.field) {
        Some(actual) => apply(condition.operator, &actual, &condition.value),
        None => false,
    }
}

/// Resolve a dotted field path against the run state.
pub fn resolve_field(state: &RunState, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.trim().split('.').collect();
    let (head, rest) = segments.split_first()?;

    match *head {
        "parameters" | "params" => {
            let (name, tail) = rest.split_first()?;
            descend(state.parameters.get(*name)?.clone(), tail)
        }
        "outputs" | "step_outputs" => {
            let (step, tail) = rest.split_first()?;
            descend(output_value(state.output(step)?), tail)
        }
        "metadata" => {
            let (step, tail) = rest.split_first()?;
            descend(Value::Object(state.metadata.get(*step)?.clone()), tail)
        }
        step if state.is_completed(step) => {
            let from_output = state
                .output(step)
                .and_then(|out| descend(output_value(out), rest));
            from_output.or_else(|| {
                if rest.is_empty() {
                    return None;
                }
                descend(Value::Object(state.metadata.get(step)?.clone()), rest)
            })
        }
        name => descend(state.parameters.get(name)?.clone(), rest),
    }
}

/// A step output as a JSON value: parsed when it is JSON, text otherwise.
fn output_value(output: &str) -> Value {
    parse_json_block(output).unwrap_or_else(|| Value::String(output.to_string()))
}

fn descend(mut value: Value, path: &[&str]) -> Option<Value> {
    for key in path {
        // Nested JSON carried as a string.
        if let Value::String(s) = &value {
            value = serde_json::from_str(s).ok()?;
        }
        value = match value {
            Value::Object(mut map) => map.remove(*key)?,
            Value::Array(mut items) => {
                let idx: usize = key.parse().ok()?;
                if idx >= items.len() {
                    return None;
                }
                items.swap_remove(idx)
            }
            _ => return None,
        };
    }
    Some(value)
}

/// Apply an operator to a resolved value and the comparison value.
pub fn apply(operator: Operator, actual: &Value, expected: &Value) -> bool {
    match operator {
        Operator::Equals => values_equal(actual, expected),
        Operator::NotEquals => !values_equal(actual, expected),
        Operator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
        Operator::LessThan => compare(actual, expected) == Some(Ordering::Less),
        Operator::GreaterOrEqual => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::LessOrEqual => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::In => member_of(actual, expected),
        Operator::NotIn => !member_of(actual, expected),
    }
}

/// Equality with the usual text-output coercions: numbers compare by value,
/// numeric strings equal numbers, `"true"`/`"false"` equal booleans.
fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
            match s.trim().to_lowercase().as_str() {
                "true" => *b,
                "false" => !*b,
                _ => false,
            }
        }
        (Value::String(x), Value::String(y)) => x.trim() == y.trim(),
        _ => false,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numeric ordering when both sides are numbers, else string ordering.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => map.contains_key(&value_to_text(needle)),
        Value::Null => false,
        other => value_to_text(other).contains(&value_to_text(needle)),
    }
}

fn member_of(value: &Value, set: &Value) -> bool {
    match set {
        Value::Array(items) => items.iter().any(|item| values_equal(value, item)),
        Value::Object(map) => map.contains_key(&value_to_text(value)),
        Value::String(list) => {
            let needle = value_to_text(value);
            list.split(',').any(|item| item.trim() == needle.trim())
        }
        _ => false,
    }
}
