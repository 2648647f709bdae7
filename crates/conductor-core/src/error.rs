use thiserror::Error;

/// A structural problem found in a template before it is compiled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Conditional edge starts from unknown step '{0}'")]
    UnknownEdgeSource(String),

    #[error("Step '{0}' has more than one conditional edge")]
    DuplicateConditionalEdge(String),

    #[error("Conditional edge from '{from}' targets unknown step '{target}'")]
    UnknownEdgeTarget { from: String, target: String },

    #[error("Alias '{alias}' points at unknown step '{target}'")]
    UnknownAliasTarget { alias: String, target: String },

    #[error("Alias '{0}' shadows a step id")]
    AliasShadowsStep(String),

    #[error("Tool-call step '{0}' has no tool name")]
    MissingToolName(String),

    #[error("Sub-workflow step '{0}' has no workflow name")]
    MissingWorkflowName(String),

    #[error("Function-call step '{0}' needs both library and function names")]
    MissingFunctionName(String),

    #[error("Circular dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Error)]
pub enum ConductorError {
    // Template errors
    #[error("Template '{template}' is invalid: {}", join_errors(.errors))]
    InvalidTemplate {
        template: String,
        errors: Vec<ValidationError>,
    },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template already registered: {0}")]
    DuplicateTemplate(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Fatal run errors
    #[error("Step '{step}' references unresolved placeholder {{{placeholder}}}")]
    UnresolvedPlaceholder { step: String, placeholder: String },

    #[error("Step '{step}' is misconfigured: {message}")]
    StepConfig { step: String, message: String },

    #[error("No {kind} collaborator configured (step '{step}')")]
    MissingCollaborator { step: String, kind: String },

    #[error(
        "Sub-workflow '{template}' exceeds max recursion depth {max_depth} (stack: {})",
        .stack.join(" -> ")
    )]
    RecursionLimit {
        template: String,
        max_depth: usize,
        stack: Vec<String>,
    },

    #[error(
        "Circular sub-workflow invocation of '{template}' (stack: {})",
        .stack.join(" -> ")
    )]
    CircularSubWorkflow { template: String, stack: Vec<String> },

    #[error("Step '{step}' exhausted its retry budget of {budget}")]
    RetryBudgetExhausted { step: String, budget: u32 },

    /// Triggered steps whose dependencies will never all complete, each
    /// rendered as `step (waiting on dep, ...)`.
    #[error("Triggered steps can never run: {}", .0.join("; "))]
    StepsNeverReady(Vec<String>),

    #[error("Sub-workflow '{template}' failed: {message}")]
    SubWorkflowFailed { template: String, message: String },

    #[error("Collaborator failed fatally: {0}")]
    CollaboratorFatal(String),

    // Retryable step errors
    #[error("Collaborator failed: {0}")]
    Collaborator(String),

    #[error("Step '{step}' timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    /// Whether a step that failed with this error may be re-entered.
    ///
    /// Only transient collaborator failures and timeouts qualify; everything
    /// else terminates the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::Collaborator(_) | ConductorError::StepTimeout { .. }
        )
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ConductorError>;
