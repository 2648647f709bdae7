//! Conductor: a workflow orchestration engine for multi-agent systems.
//!
//! Templates describe steps, their dependencies and conditional routes.
//! They are validated and compiled once into a [`TemplateRegistry`], and a
//! [`WorkflowEngine`] runs them against pluggable collaborators (agents,
//! tools, function libraries and direct model calls).
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use conductor::{Collaborators, Template, Step, TemplateRegistry, WorkflowEngine};
//!
//! # async fn demo(agent: Arc<dyn conductor::AgentCollaborator>) -> conductor::Result<()> {
//! let mut registry = TemplateRegistry::new();
//! registry.register(
//!     Template::new("hello")
//!         .with_step(Step::agent("greet", "Say hello to {name}"))
//!         .with_parameter("name", "world".into()),
//! )?;
//!
//! let engine = WorkflowEngine::new(Arc::new(registry), Collaborators::new().with_agent(agent));
//! let result = engine.run("hello", HashMap::new()).await?;
//! println!("{:?}", result.output);
//! # Ok(())
//! # }
//! ```

pub use conductor_core::config::{EngineConfig, LogConfig};
pub use conductor_core::error::{ConductorError, Result, ValidationError};
pub use conductor_core::event::EventBus;
pub use conductor_core::template::{
    Condition, ConditionalEdge, Operator, Step, StepKind, Template,
};
pub use conductor_core::traits::{
    AgentCollaborator, FunctionCollaborator, ModelCollaborator, ToolCollaborator,
};
pub use conductor_core::types::{
    ChatTurn, ExecutionLogEntry, ModelRequest, Role, RunEvent, RunId, RunResult,
};
pub use conductor_engine::{
    compile, validate, Collaborators, CompiledWorkflow, RunLogger, Successors,
    TemplateRegistry, WorkflowEngine,
};

pub use conductor_core;
pub use conductor_engine;

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "conductor=info,warn";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (or [`DEFAULT_LOG_FILTER`]).
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing(default_directive: Option<&str>) {
    let fallback = default_directive.unwrap_or(DEFAULT_LOG_FILTER);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .try_init();
}
