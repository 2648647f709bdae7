use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::ModelRequest;

// Collaborators report failures as `ConductorError`. `Collaborator(..)` and
// `StepTimeout { .. }` are retried; any other variant ends the run.

/// Agent collaborator: instruction in, text out.
pub trait AgentCollaborator: Send + Sync + 'static {
    /// Run an agent on the resolved instruction. `agent` names a profile
    /// when the step selects one.
    fn invoke(&self, agent: Option<&str>, instruction: String) -> BoxFuture<'_, Result<String>>;
}

/// Tool collaborator: calls an externally discovered tool.
pub trait ToolCollaborator: Send + Sync + 'static {
    /// Call `tool` with structured arguments.
    fn call(&self, tool: &str, arguments: Value) -> BoxFuture<'_, Result<String>>;

    /// Name of the tool's required parameter, used to wrap plain-text
    /// instructions. `None` if the tool is unknown or declares none.
    fn required_parameter(&self, tool: &str) -> Option<String> {
        let _ = tool;
        None
    }
}

/// Function-library collaborator.
pub trait FunctionCollaborator: Send + Sync + 'static {
    /// Call `library::function` with named arguments, returning a structured result.
    fn call(
        &self,
        library: &str,
        function: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> BoxFuture<'_, Result<Value>>;
}

/// Direct model collaborator: a single completion with optional history.
pub trait ModelCollaborator: Send + Sync + 'static {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>>;
}
