//! Shared domain types for the Conductor workflow engine.
//!
//! This crate contains the data model used across the workspace: workflow
//! definitions, runs, step attempts, the execution context, executor
//! outcomes, engine events, configuration, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod history;
pub mod run;
pub mod step;
pub mod workflow;
