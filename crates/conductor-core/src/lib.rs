pub mod config;
pub mod error;
pub mod event;
pub mod template;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{ConductorError, Result, ValidationError};
pub use event::EventBus;
pub use template::{Condition, ConditionalEdge, Operator, Step, StepKind, Template};
pub use types::*;
