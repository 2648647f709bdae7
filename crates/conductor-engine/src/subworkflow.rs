//! Recursion guard and parameter hand-off for nested workflow runs.

use std::collections::HashMap;

use serde_json::Value;

use conductor_core::error::{ConductorError, Result};

/// Where a run sits in the chain of nested invocations.
///
/// Passed down explicitly: a top-level run starts at depth 0 with only its
/// own template on the stack, and every sub-workflow step derives the
/// child's context with [`enter`](Self::enter).
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    pub depth: usize,
    /// Template names from the outermost run to the current one.
    pub stack: Vec<String>,
}

impl InvocationContext {
    pub fn root(template: impl Into<String>) -> Self {
        Self {
            depth: 0,
            stack: vec![template.into()],
        }
    }

    /// Context for invoking `template` from the current run.
    ///
    /// Fails when the current depth has reached `max_depth`, or when
    /// `template` is already active further up the stack.
    pub fn enter(&self, template: &str, max_depth: usize) -> Result<Self> {
        if self.depth >= max_depth {
            return Err(ConductorError::RecursionLimit {
                template: template.to_string(),
                max_depth,
                stack: self.stack_with(template),
            });
        }
        if self.stack.iter().any(|active| active == template) {
            return Err(ConductorError::CircularSubWorkflow {
                template: template.to_string(),
                stack: self.stack_with(template),
            });
        }
        Ok(Self {
            depth: self.depth + 1,
            stack: self.stack_with(template),
        })
    }

    fn stack_with(&self, template: &str) -> Vec<String> {
        let mut stack = self.stack.clone();
        stack.push(template.to_string());
        stack
    }
}

/// Parameters for a nested run: the caller's parameters, then (optionally)
/// every caller step output as `<step>_output`, then explicit overrides.
pub fn sub_parameters(
    caller: &HashMap<String, Value>,
    outputs: Option<&HashMap<String, String>>,
    overrides: HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut params = caller.clone();
    if let Some(outputs) = outputs {
        for (step_id, output) in outputs {
            params.insert(format!("{step_id}_output"), Value::String(output.clone()));
        }
    }
    params.extend(overrides);
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enter_increments_depth() {
        let root = InvocationContext::root("outer");
        let child = root.enter("inner", 5).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.stack, vec!["outer", "inner"]);
    }

    #[test]
    fn test_circular_invocation_rejected() {
        let ctx = InvocationContext::root("a").enter("b", 5).unwrap();
        match ctx.enter("a", 5) {
            Err(ConductorError::CircularSubWorkflow { template, stack }) => {
                assert_eq!(template, "a");
                assert_eq!(stack, vec!["a", "b", "a"]);
            }
            other => panic!("expected circular error, got {other:?}"),
        }
    }

    #[test]
    fn test_depth_limit() {
        let ctx = InvocationContext::root("l0")
            .enter("l1", 2)
            .unwrap()
            .enter("l2", 2)
            .unwrap();
        let err = ctx.enter("l3", 2).unwrap_err();
        assert!(matches!(err, ConductorError::RecursionLimit { max_depth: 2, .. }));
        assert!(err.to_string().contains("l0 -> l1 -> l2 -> l3"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_sub_parameters_precedence() {
        let caller = HashMap::from([
            ("topic".to_string(), json!("rust")),
            ("draft_output".to_string(), json!("stale")),
        ]);
        let outputs = HashMap::from([("draft".to_string(), "fresh".to_string())]);
        let overrides = HashMap::from([("topic".to_string(), json!("go"))]);

        let params = sub_parameters(&caller, Some(&outputs), overrides.clone());
        assert_eq!(params["topic"], json!("go"));
        assert_eq!(params["draft_output"], json!("fresh"));

        let params = sub_parameters(&caller, None, overrides);
        assert_eq!(params["draft_output"], json!("stale"));
    }
}
