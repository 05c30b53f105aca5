//! Sandboxed judging core.
//!
//! Pipeline per submission:
//! registry lookup -> [`compiler`] (once) -> [`engine`] (once per test case,
//! fresh sandbox each time) -> [`evaluator`] -> ordered results.
//! [`executor::Orchestrator`] drives the pipeline; [`sandbox`] owns every
//! interaction with the isolation backend.

pub mod compiler;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod sandbox;

pub use executor::{JudgeError, JudgeSettings, Orchestrator};
pub use sandbox::{ExecutionOutcome, IsolationProvider, SandboxError, SandboxLimits, SandboxPool};
