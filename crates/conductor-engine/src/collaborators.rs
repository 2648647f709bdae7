use std::sync::Arc;

use conductor_core::traits::{
    AgentCollaborator, FunctionCollaborator, ModelCollaborator, ToolCollaborator,
};

/// External systems the engine delegates steps to, one per step kind.
///
/// Any of them may be absent; a step whose kind needs a missing
/// collaborator fails the run with `MissingCollaborator`.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub agent: Option<Arc<dyn AgentCollaborator>>,
    pub tool: Option<Arc<dyn ToolCollaborator>>,
    pub function: Option<Arc<dyn FunctionCollaborator>>,
    pub model: Option<Arc<dyn ModelCollaborator>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: Arc<dyn AgentCollaborator>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn ToolCollaborator>) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_function(mut self, function: Arc<dyn FunctionCollaborator>) -> Self {
        self.function = Some(function);
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ModelCollaborator>) -> Self {
        self.model = Some(model);
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("agent", &self.agent.is_some())
            .field("tool", &self.tool.is_some())
            .field("function", &self.function.is_some())
            .field("model", &self.model.is_some())
            .finish()
    }
}
