//! Template data model: the declarative description of a workflow.
//!
//! A [`Template`] is a list of [`Step`]s plus the [`ConditionalEdge`]s that
//! route between them at runtime. Templates are exchanged as JSON documents
//! and are immutable once loaded: the engine validates and compiles them,
//! and every run reads the same shared copy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Unique name within a registry.
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Parameter defaults. Callers may override any of them per run.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdge>,
    /// Route aliases: extra names a conditional edge may target, each
    /// re-entering the step it points at.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Template {
    /// Create an empty template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            parameters: HashMap::new(),
            steps: vec![],
            conditional_edges: vec![],
            aliases: HashMap::new(),
        }
    }

    /// Parse a template from its JSON document form.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, default: Value) -> Self {
        self.parameters.insert(name.into(), default);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_conditional_edge(mut self, edge: ConditionalEdge) -> Self {
        self.conditional_edges.push(edge);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), step_id.into());
        self
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether `id` names a declared step.
    pub fn has_step(&self, id: &str) -> bool {
        self.steps.iter().any(|s| s.id == id)
    }

    /// The conditional edge leaving `step_id`, if any.
    pub fn conditional_edge_from(&self, step_id: &str) -> Option<&ConditionalEdge> {
        self.conditional_edges.iter().find(|e| e.from_step == step_id)
    }

    /// Map a routing target to the step it runs: aliases resolve to their
    /// step, anything else is returned unchanged.
    pub fn resolve_target<'a>(&'a self, target: &'a str) -> &'a str {
        self.aliases.get(target).map(String::as_str).unwrap_or(target)
    }
}

/// One unit of work in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within the template.
    pub id: String,
    /// What kind of collaborator runs this step, with its kind-specific fields.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Instruction text with `{placeholder}` references.
    #[serde(default)]
    pub instruction: String,
    /// Steps that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Label for steps that may run concurrently. Advisory: scheduling
    /// follows `depends_on` alone, and a label shared by steps that depend
    /// on each other only draws a compile-time warning.
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Per-step timeout (falls back to the engine default).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Maximum number of attempts (falls back to the engine's `max_retries`).
    #[serde(default)]
    pub retry_budget: Option<u32>,
    /// Explicit loop family label, grouping repeated iterations of a step.
    #[serde(default)]
    pub loop_family: Option<String>,
}

impl Step {
    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            instruction: String::new(),
            depends_on: vec![],
            parallel_group: None,
            timeout_secs: None,
            retry_budget: None,
            loop_family: None,
        }
    }

    /// An agent step.
    pub fn agent(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        let mut step = Self::with_kind(id, StepKind::Agent { agent: None });
        step.instruction = instruction.into();
        step
    }

    /// A tool-call step.
    pub fn tool(
        id: impl Into<String>,
        tool: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        let mut step = Self::with_kind(
            id,
            StepKind::ToolCall {
                tool: Some(tool.into()),
                argument_name: None,
            },
        );
        step.instruction = instruction.into();
        step
    }

    /// A function-call step.
    pub fn function(
        id: impl Into<String>,
        library: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            StepKind::FunctionCall {
                library: Some(library.into()),
                function: Some(function.into()),
                arguments: serde_json::Map::new(),
            },
        )
    }

    /// A sub-workflow step.
    pub fn sub_workflow(id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::SubWorkflow {
                workflow: Some(workflow.into()),
                parameters: HashMap::new(),
                max_depth: None,
                expose_outputs: false,
            },
        )
    }

    /// A direct model call.
    pub fn model(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        let mut step = Self::with_kind(
            id,
            StepKind::DirectModelCall {
                provider: None,
                model: None,
                settings: serde_json::Map::new(),
                system_prompt: None,
                history_from: vec![],
            },
        );
        step.instruction = instruction.into();
        step
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn in_loop_family(mut self, family: impl Into<String>) -> Self {
        self.loop_family = Some(family.into());
        self
    }

    /// Replace the kind-specific fields.
    pub fn with_step_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    /// Effective retry budget given the run-wide maximum.
    pub fn budget(&self, run_max: u32) -> u32 {
        self.retry_budget.unwrap_or(run_max)
    }
}

/// Kind of collaborator a step is delegated to.
///
/// Each variant carries only the fields its collaborator needs. Names are
/// optional in the document so the validator can report them as missing
/// instead of failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    /// An opaque task-performing agent.
    Agent {
        /// Named agent profile, if the collaborator hosts several.
        #[serde(default)]
        agent: Option<String>,
    },
    /// A call to an externally discovered tool.
    ToolCall {
        #[serde(default)]
        tool: Option<String>,
        /// Argument key used when the instruction is not a JSON object.
        /// Falls back to the tool's declared required parameter.
        #[serde(default)]
        argument_name: Option<String>,
    },
    /// A nested workflow run.
    SubWorkflow {
        #[serde(default)]
        workflow: Option<String>,
        /// Parameter overrides (string values accept placeholders).
        #[serde(default)]
        parameters: HashMap<String, Value>,
        /// Recursion depth limit (falls back to the engine default).
        #[serde(default)]
        max_depth: Option<usize>,
        /// Expose the caller's step outputs as `<step>_output` parameters.
        #[serde(default)]
        expose_outputs: bool,
    },
    /// A function from a named library.
    FunctionCall {
        #[serde(default)]
        library: Option<String>,
        #[serde(default)]
        function: Option<String>,
        /// Named arguments (string values accept placeholders).
        #[serde(default)]
        arguments: serde_json::Map<String, Value>,
    },
    /// A single model completion without an agent loop.
    DirectModelCall {
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        settings: serde_json::Map<String, Value>,
        #[serde(default)]
        system_prompt: Option<String>,
        /// Steps whose outputs are replayed as conversation history;
        /// `"*"` selects every completed step.
        #[serde(default)]
        history_from: Vec<String>,
    },
}

impl StepKind {
    /// Stable name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::ToolCall { .. } => "tool-call",
            StepKind::SubWorkflow { .. } => "sub-workflow",
            StepKind::FunctionCall { .. } => "function-call",
            StepKind::DirectModelCall { .. } => "direct-model-call",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime-evaluated routing out of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalEdge {
    pub from_step: String,
    /// Evaluated in order; the first match wins.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Target when no condition matches.
    pub default: String,
}

impl ConditionalEdge {
    pub fn new(from_step: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            from_step: from_step.into(),
            conditions: vec![],
            default: default.into(),
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Every target this edge can route to, default last.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .map(|c| c.target.as_str())
            .chain(std::iter::once(self.default.as_str()))
    }
}

/// One predicate of a conditional edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into parameters, step outputs, or derived metadata.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    pub target: String,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: Operator,
        value: Value,
        target: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            target: target.into(),
        }
    }
}

/// Comparison operators for conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "==", alias = "eq")]
    Equals,
    #[serde(alias = "!=", alias = "ne")]
    NotEquals,
    #[serde(alias = ">", alias = "gt")]
    GreaterThan,
    #[serde(alias = "<", alias = "lt")]
    LessThan,
    #[serde(alias = ">=", alias = "ge")]
    GreaterOrEqual,
    #[serde(alias = "<=", alias = "le")]
    LessOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builders() {
        let step = Step::agent("research", "Study {topic}")
            .depends_on(["plan"])
            .in_group("gather")
            .with_timeout(30)
            .with_retry_budget(2);

        assert_eq!(step.id, "research");
        assert_eq!(step.kind.name(), "agent");
        assert_eq!(step.depends_on, vec!["plan"]);
        assert_eq!(step.parallel_group.as_deref(), Some("gather"));
        assert_eq!(step.timeout_secs, Some(30));
        assert_eq!(step.budget(5), 2);
        assert_eq!(Step::agent("x", "").budget(5), 5);
    }

    #[test]
    fn test_parse_template_document() {
        let doc = json!({
            "name": "review",
            "parameters": {"topic": "rust"},
            "steps": [
                {"id": "fetch", "kind": "tool-call", "tool": "http_get", "instruction": "{\"url\": \"{topic}\"}"},
                {"id": "check", "kind": "agent", "instruction": "Check {fetch}", "depends_on": ["fetch"]},
                {"id": "sum", "kind": "function-call", "library": "math", "function": "sum",
                 "arguments": {"a": 1}, "depends_on": ["check"]},
                {"id": "nested", "kind": "sub-workflow", "workflow": "inner", "max_depth": 2},
                {"id": "ask", "kind": "direct-model-call", "model": "small", "history_from": ["check"]}
            ],
            "conditional_edges": [
                {"from_step": "check", "default": "sum",
                 "conditions": [{"field": "check.ok", "operator": "==", "value": false, "target": "retry_fetch"}]}
            ],
            "aliases": {"retry_fetch": "fetch"}
        });

        let template: Template = serde_json::from_value(doc).unwrap();
        assert_eq!(template.version, "1.0");
        assert_eq!(template.steps.len(), 5);
        assert!(matches!(
            template.steps[0].kind,
            StepKind::ToolCall { ref tool, .. } if tool.as_deref() == Some("http_get")
        ));
        assert!(matches!(
            template.steps[3].kind,
            StepKind::SubWorkflow { max_depth: Some(2), .. }
        ));
        let edge = template.conditional_edge_from("check").unwrap();
        assert_eq!(edge.conditions[0].operator, Operator::Equals);
        assert_eq!(edge.targets().collect::<Vec<_>>(), vec!["retry_fetch", "sum"]);
        assert_eq!(template.resolve_target("retry_fetch"), "fetch");
        assert_eq!(template.resolve_target("sum"), "sum");
    }

    #[test]
    fn test_missing_kind_fields_still_parse() {
        let step: Step =
            serde_json::from_value(json!({"id": "t", "kind": "tool-call"})).unwrap();
        assert!(matches!(step.kind, StepKind::ToolCall { tool: None, .. }));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed = serde_json::from_value::<Step>(json!({"id": "t", "kind": "teleport"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_operator_spellings() {
        let ops: Vec<Operator> =
            serde_json::from_value(json!(["equals", "!=", "gt", "<=", "not_in", "contains"]))
                .unwrap();
        assert_eq!(
            ops,
            vec![
                Operator::Equals,
                Operator::NotEquals,
                Operator::GreaterThan,
                Operator::LessOrEqual,
                Operator::NotIn,
                Operator::Contains
            ]
        );
    }
}
