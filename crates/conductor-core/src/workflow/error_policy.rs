//! Error handling policy: what happens once a step has failed for good.

use conductor_types::workflow::{ErrorPolicy, StepSpec, WorkflowDefinition};

/// Resolved action for a permanently failed step.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorAction {
    /// Record the step as skipped and move on.
    Continue,
    /// Fail the run.
    Fail,
    /// Run this compensating step once, then fail the run.
    Compensate(StepSpec),
}

/// Stateless resolver from step override / workflow default to an action.
pub struct ErrorPolicyHandler;

impl ErrorPolicyHandler {
    pub fn decide(step: &StepSpec, definition: &WorkflowDefinition) -> ErrorAction {
        match definition.error_policy_for(step) {
            ErrorPolicy::Fail => ErrorAction::Fail,
            ErrorPolicy::Continue => ErrorAction::Continue,
            ErrorPolicy::Compensate { step } => ErrorAction::Compensate(step.as_ref().clone()),
        }
    }
}
