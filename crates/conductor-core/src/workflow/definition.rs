//! Workflow definition parsing and validation.
//!
//! A definition is validated once when it is registered and again when a run
//! is started from it, so a malformed definition never reaches the state
//! machine.

use std::collections::HashSet;

use conductor_types::workflow::{ErrorPolicy, RetryPolicy, StepSpec, WorkflowDefinition};

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Errors from parsing or validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),
}

fn invalid(msg: impl Into<String>) -> WorkflowError {
    WorkflowError::ValidationError(msg.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a definition from JSON and validate it.
pub fn parse_definition(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check the structural rules every stored definition must satisfy.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(invalid("workflow id must not be empty"));
    }
    if def.steps.is_empty() {
        return Err(invalid(format!(
            "workflow '{}' must declare at least one step",
            def.id
        )));
    }

    validate_retry_policy(&def.default_retry_policy, "default retry policy")?;
    validate_error_policy(&def.default_error_policy, "default error policy")?;

    let mut names = HashSet::new();
    for step in &def.steps {
        validate_step(step)?;
        if !names.insert(step.name.as_str()) {
            return Err(invalid(format!("duplicate step name '{}'", step.name)));
        }
    }

    // Compensation attempts are recorded under their own step name, so a
    // collision would break attempt numbering for the workflow step.
    for step in &def.steps {
        if let ErrorPolicy::Compensate { step: comp } = def.error_policy_for(step) {
            if names.contains(comp.name.as_str()) {
                return Err(invalid(format!(
                    "compensating step '{}' of '{}' collides with a workflow step",
                    comp.name, step.name
                )));
            }
        }
    }

    Ok(())
}

fn validate_step(step: &StepSpec) -> Result<(), WorkflowError> {
    if step.name.trim().is_empty() {
        return Err(invalid("step name must not be empty"));
    }
    if step.executor_ref.trim().is_empty() {
        return Err(invalid(format!(
            "step '{}' has an empty executor_ref",
            step.name
        )));
    }
    if step.timeout_ms == Some(0) {
        return Err(invalid(format!(
            "step '{}' timeout_ms must be greater than zero",
            step.name
        )));
    }
    if let Some(retry) = &step.retry {
        validate_retry_policy(retry, &format!("retry policy of step '{}'", step.name))?;
    }
    if let Some(policy) = &step.on_error {
        validate_error_policy(policy, &format!("error policy of step '{}'", step.name))?;
    }
    Ok(())
}

fn validate_retry_policy(policy: &RetryPolicy, scope: &str) -> Result<(), WorkflowError> {
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Err(invalid(format!(
            "{scope}: multiplier must be a finite number >= 1.0"
        )));
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        return Err(invalid(format!(
            "{scope}: base_delay_ms ({}) exceeds max_delay_ms ({})",
            policy.base_delay_ms, policy.max_delay_ms
        )));
    }
    Ok(())
}

fn validate_error_policy(policy: &ErrorPolicy, scope: &str) -> Result<(), WorkflowError> {
    if let ErrorPolicy::Compensate { step } = policy {
        validate_step(step)?;
        if matches!(step.on_error, Some(ErrorPolicy::Compensate { .. })) {
            return Err(invalid(format!(
                "{scope}: compensating step '{}' cannot itself compensate",
                step.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
