//! Engine configuration types.
//!
//! `EngineConfig` represents `conductor.toml`. Every field has a default, so
//! an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Conductor engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on runs driven concurrently by the scheduler.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Timeout applied to steps that do not declare one.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// SQLite connection URL. `None` means `{data_dir}/conductor.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_concurrent_runs() -> usize {
    16
}

fn default_event_capacity() -> usize {
    1024
}

fn default_step_timeout_ms() -> u64 {
    crate::workflow::DEFAULT_STEP_TIMEOUT_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            event_capacity: default_event_capacity(),
            default_step_timeout_ms: default_step_timeout_ms(),
            database_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
