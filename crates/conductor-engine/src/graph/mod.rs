//! Template analysis: validation, loop pattern detection, and compilation
//! into an executable graph.
//!
//! A template goes through [`validate`] (all structural findings at once),
//! then [`compile`], which wires each step to its successors: a direct
//! edge, a fan-out of unordered dependents, a runtime-evaluated conditional
//! edge, or the terminal sink. Loop patterns are detected once at compile
//! time and only feed alias resolution.

pub mod compiler;
pub mod loops;
pub mod validator;

pub use compiler::{compile, CompiledWorkflow, Successors};
pub use loops::{AliasKind, LoopPatterns};
pub use validator::validate;
