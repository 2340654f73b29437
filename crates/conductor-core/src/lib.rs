//! Orchestration logic and repository trait definitions for Conductor.
//!
//! This crate defines the "ports" (repository and history traits) that the
//! infrastructure layer implements, plus the state machine that drives runs.
//! It depends only on `conductor-types` -- never on `conductor-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
