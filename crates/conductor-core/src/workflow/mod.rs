//! Workflow engine core: definitions, policies, and the orchestration state machine.
//!
//! - `definition` -- JSON parsing and structural validation
//! - `executor` -- Step executor contract and registry
//! - `retry` -- Backoff computation and retry decisions
//! - `error_policy` -- Continue / fail / compensate resolution
//! - `lease` -- Per-run exclusive leases
//! - `checkpoint` -- Durable run checkpoints and attempt history
//! - `engine` -- The `Orchestrator` state machine and lifecycle API
//! - `scheduler` -- Driver loops over `advance`

pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod error_policy;
pub mod executor;
pub mod lease;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineError, Orchestrator};
pub use executor::{BoxStepExecutor, ExecutorRegistry, StepExecutor};
pub use scheduler::RunScheduler;
