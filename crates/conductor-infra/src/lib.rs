//! Infrastructure layer for Conductor.
//!
//! Contains implementations of the storage ports defined in `conductor-core`
//! (SQLite workflow repository and attempt history) and the `config.toml`
//! loader.

pub mod config;
pub mod sqlite;
