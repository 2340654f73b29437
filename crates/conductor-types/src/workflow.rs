//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the static, versioned description of a workflow:
//! the ordered steps, the executor each step delegates to, and the retry and
//! error-handling rules that apply when a step fails. Definitions are
//! immutable once stored and are identified by `(id, version)`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow reference
// ---------------------------------------------------------------------------

/// Identity of a stored workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub id: String,
    pub version: u32,
}

impl WorkflowRef {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The static description of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "document-review").
    pub id: String,
    /// Definition version; a changed definition gets a new version.
    pub version: u32,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps, executed strictly in this order.
    pub steps: Vec<StepSpec>,
    /// Retry policy for steps without their own override.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    /// Error policy for steps without their own override.
    #[serde(default)]
    pub default_error_policy: ErrorPolicy,
    /// Extensible metadata, never interpreted by the engine.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef::new(self.id.clone(), self.version)
    }

    /// The step at a given position, if any remain.
    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    /// Position of a step by name.
    pub fn step_position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Effective retry policy for a step (override or workflow default).
    pub fn retry_policy_for<'a>(&'a self, step: &'a StepSpec) -> &'a RetryPolicy {
        step.retry.as_ref().unwrap_or(&self.default_retry_policy)
    }

    /// Effective error policy for a step (override or workflow default).
    pub fn error_policy_for<'a>(&'a self, step: &'a StepSpec) -> &'a ErrorPolicy {
        step.on_error.as_ref().unwrap_or(&self.default_error_policy)
    }
}

// ---------------------------------------------------------------------------
// Step Spec
// ---------------------------------------------------------------------------

/// A single named step delegated to an external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within a workflow.
    pub name: String,
    /// Key of the executor in the executor registry.
    pub executor_ref: String,
    /// Upper bound on a single attempt. `None` uses the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Error policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
    /// Failure codes that are permanent for this step even when the executor
    /// reports them as retryable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fatal_error_codes: Vec<String>,
}

/// Default step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

impl StepSpec {
    /// A step with default timeout and no overrides.
    pub fn new(name: impl Into<String>, executor_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor_ref: executor_ref.into(),
            timeout_ms: None,
            retry: None,
            on_error: None,
            fatal_error_codes: Vec::new(),
        }
    }

    /// Effective timeout given the engine-wide default.
    pub fn effective_timeout_ms(&self, default_ms: u64) -> u64 {
        self.timeout_ms.unwrap_or(default_ms)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_on_error(mut self, on_error: ErrorPolicy) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub fn with_fatal_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal_error_codes = codes.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Exponential backoff configuration.
///
/// A failure on attempt `n` is retried while `n <= max_attempts`, after
/// `base_delay_ms * multiplier^(n-1)` capped at `max_delay_ms`. A failure on
/// attempt `max_attempts + 1` gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// How a failed attempt is classified before consulting the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient: network blip, rate limit, transient model error.
    Retryable,
    /// Permanent: malformed input, validation rejection, policy violation.
    Fatal,
    /// The executor exceeded the step timeout.
    Timeout,
}

// ---------------------------------------------------------------------------
// Error Policy
// ---------------------------------------------------------------------------

/// What to do once a step has failed for good.
///
/// Tagged by `action`:
/// ```json
/// { "action": "compensate", "step": { "name": "release-slot", "executor_ref": "slots" } }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the whole run.
    #[default]
    Fail,
    /// Skip the step and carry on with the next one.
    Continue,
    /// Run a compensating step, then fail the run.
    Compensate { step: Box<StepSpec> },
}
