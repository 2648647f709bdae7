pub mod collaborators;
pub mod condition;
pub mod dispatcher;
pub mod engine;
pub mod graph;
pub mod metadata;
pub mod registry;
pub mod run_log;
pub mod state;
pub mod substitution;
pub mod subworkflow;

pub use collaborators::Collaborators;
pub use engine::WorkflowEngine;
pub use graph::{compile, validate, CompiledWorkflow, LoopPatterns, Successors};
pub use registry::TemplateRegistry;
pub use run_log::RunLogger;
pub use state::{RunError, RunState, StepOutcome, StepUpdate};
pub use subworkflow::InvocationContext;
