//! Orchestration state machine.
//!
//! The `Orchestrator` is the only component that mutates a run. Callers drive
//! it cooperatively: each `advance` call performs at most one state
//! transition and returns the run as persisted afterwards.
//!
//! # Advance flow
//!
//! 1. Take the in-process lease, then the storage lease shared with other
//!    orchestrators on the same store (conflict -> `EngineError::LeaseConflict`).
//! 2. Load the run; terminal runs are returned unchanged.
//! 3. A run found in `StepExecuting` is reconciled from history first, so an
//!    outcome that was already recorded is never lost to a later cancel.
//! 4. Honour a pending cancellation.
//! 5. Return early while a retry is not yet due.
//! 6. Past the last step -> `Completed`.
//! 7. Otherwise persist `StepExecuting` (and `Running` first for a `Pending`
//!    run), invoke the executor under the step timeout, append the attempt,
//!    then persist the resulting state.
//! 8. Release the storage lease, whatever the outcome.
//!
//! History is always appended before the run is saved, so the run never
//! moves past an outcome that was not durably recorded.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conductor_types::config::EngineConfig;
use conductor_types::context::{ExecutionContext, OutputDelta};
use conductor_types::error::RepositoryError;
use conductor_types::event::EngineEvent;
use conductor_types::history::{AttemptOutcome, AttemptRole, ErrorDetail, StepAttempt};
use conductor_types::run::{Run, RunFailure, RunStatus, RunStatusView};
use conductor_types::step::{StepOutcome, StepRequest};
use conductor_types::workflow::{
    DEFAULT_STEP_TIMEOUT_MS, ErrorPolicy, FailureKind, StepSpec, WorkflowDefinition, WorkflowRef,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::history::HistoryStore;
use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::definition::{WorkflowError, validate_definition};
use super::error_policy::{ErrorAction, ErrorPolicyHandler};
use super::executor::{BoxStepExecutor, ExecutorRegistry};
use super::lease::{LeaseManager, STORE_LEASE_GRACE};
use super::retry::{RetryDecision, RetryHandler, RetryState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Error code recorded when a step exceeds its timeout.
pub const CODE_TIMEOUT: &str = "timeout";

/// Error code recorded when a run is cancelled at a step.
pub const CODE_CANCELLED: &str = "cancelled";

/// Error code recorded when a step's output breaks the context size limits.
pub const CODE_CONTEXT_LIMIT: &str = "context_limit";

/// Error code recorded when a compensating step has no registered executor.
pub const CODE_UNKNOWN_EXECUTOR: &str = "unknown_executor";

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the run lifecycle API.
///
/// Step failures are not errors: they end up in history and, when final, in
/// the run's `last_error`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The history store or run repository failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(WorkflowRef),

    #[error("workflow definition already exists: {0}")]
    DefinitionExists(WorkflowRef),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] WorkflowError),

    #[error("step '{step}' references unregistered executor '{executor_ref}'")]
    UnknownExecutor { step: String, executor_ref: String },

    /// Another caller is advancing this run right now.
    #[error("run {0} is being advanced by another caller")]
    LeaseConflict(Uuid),
}

impl EngineError {
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, EngineError::LeaseConflict(_))
    }
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::RunNotFound(run_id) => EngineError::RunNotFound(run_id),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation helpers
// ---------------------------------------------------------------------------

/// How an executor call ended from the engine's point of view.
enum Invocation {
    Finished(StepOutcome),
    TimedOut,
    Cancelled,
}

async fn invoke(
    executor: &BoxStepExecutor,
    request: StepRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Invocation {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Invocation::Cancelled,
        result = tokio::time::timeout(timeout, executor.execute(request)) => match result {
            Ok(outcome) => Invocation::Finished(outcome),
            Err(_) => Invocation::TimedOut,
        },
    }
}

/// Registers a cancellation token for the in-flight call; removes it on drop.
struct InFlight<'a> {
    table: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
    token: CancellationToken,
}

impl<'a> InFlight<'a> {
    fn register(table: &'a DashMap<Uuid, CancellationToken>, run_id: Uuid) -> Self {
        let token = CancellationToken::new();
        table.insert(run_id, token.clone());
        Self {
            table,
            run_id,
            token,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.run_id);
    }
}

/// Start and end of one attempt.
#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl Window {
    fn instant() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
        }
    }
}

fn step_attempt(
    run: &Run,
    step_name: &str,
    attempt_number: u32,
    window: Window,
    outcome: AttemptOutcome,
) -> StepAttempt {
    StepAttempt {
        run_id: run.run_id,
        step_name: step_name.to_string(),
        step_index: run.current_step_index,
        attempt_number,
        role: AttemptRole::Step,
        started_at: window.started_at,
        finished_at: Some(window.finished_at),
        outcome,
        output_delta: OutputDelta::new(),
        error_detail: None,
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The orchestration state machine and run lifecycle API.
///
/// Generic over the storage ports. Holds no background tasks: nothing
/// happens unless a caller invokes `advance` (directly or via
/// `RunScheduler`).
pub struct Orchestrator<R: WorkflowRepository, H: HistoryStore> {
    checkpoint: CheckpointManager<R, H>,
    executors: ExecutorRegistry,
    event_bus: EventBus,
    leases: LeaseManager,
    /// Identifies this orchestrator as a storage lease holder.
    holder: String,
    /// Cancellation tokens of executor calls in progress, keyed by run.
    in_flight: DashMap<Uuid, CancellationToken>,
    default_step_timeout_ms: u64,
}

impl<R: WorkflowRepository, H: HistoryStore> Orchestrator<R, H> {
    pub fn new(repo: R, history: H, executors: ExecutorRegistry, event_bus: EventBus) -> Self {
        Self {
            checkpoint: CheckpointManager::new(repo, history),
            executors,
            event_bus,
            leases: LeaseManager::new(),
            holder: Uuid::now_v7().to_string(),
            in_flight: DashMap::new(),
            default_step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
        }
    }

    /// Build an orchestrator using the event capacity and step timeout from
    /// the engine configuration.
    pub fn from_config(
        repo: R,
        history: H,
        executors: ExecutorRegistry,
        config: &EngineConfig,
    ) -> Self {
        Self::new(repo, history, executors, EventBus::new(config.event_capacity))
            .with_default_step_timeout_ms(config.default_step_timeout_ms)
    }

    /// Timeout for steps that do not declare one.
    pub fn with_default_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_step_timeout_ms = timeout_ms.max(1);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn checkpoint(&self) -> &CheckpointManager<R, H> {
        &self.checkpoint
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Name this orchestrator takes storage leases under.
    pub fn holder_id(&self) -> &str {
        &self.holder
    }

    // -----------------------------------------------------------------------
    // Lifecycle API
    // -----------------------------------------------------------------------

    /// Validate and store a new workflow definition.
    pub async fn register_definition(&self, def: &WorkflowDefinition) -> Result<(), EngineError> {
        validate_definition(def)?;
        self.checkpoint
            .repo()
            .save_definition(def)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => EngineError::DefinitionExists(def.workflow_ref()),
                other => EngineError::Storage(other.to_string()),
            })?;

        tracing::info!(
            workflow = %def.workflow_ref(),
            steps = def.steps.len(),
            "registered workflow definition"
        );
        Ok(())
    }

    /// Create a `Pending` run of a stored definition.
    pub async fn start_run(
        &self,
        workflow: &WorkflowRef,
        initial_context: ExecutionContext,
    ) -> Result<Uuid, EngineError> {
        let definition = self.load_definition(workflow).await?;
        validate_definition(&definition)?;
        self.ensure_executors(&definition)?;

        let run = Run::new(workflow.clone(), initial_context);
        self.checkpoint
            .repo()
            .create_run(&run)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        tracing::info!(run_id = %run.run_id, workflow = %workflow, "started workflow run");
        self.event_bus.publish(EngineEvent::RunStarted {
            run_id: run.run_id,
            workflow: workflow.clone(),
        });

        Ok(run.run_id)
    }

    /// Caller-facing status summary.
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunStatusView, EngineError> {
        let run = self.checkpoint.load_run(run_id).await?;
        let definition = self.load_definition(&run.workflow).await?;

        Ok(RunStatusView {
            run_id,
            status: run.status,
            current_step: definition
                .step(run.current_step_index)
                .map(|s| s.name.clone()),
            attempt: run.current_attempt,
            last_error: run.last_error,
            next_retry_at: run.next_retry_at,
        })
    }

    /// Request cancellation of a run.
    ///
    /// Sets the run's cancel flag and signals the in-flight executor call,
    /// if any. The transition to `Failed` happens in `advance`. Returns
    /// `false` when the run was already terminal.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool, EngineError> {
        let requested = self
            .checkpoint
            .repo()
            .request_cancel(&run_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => EngineError::RunNotFound(run_id),
                other => EngineError::Storage(other.to_string()),
            })?;

        if requested {
            if let Some(token) = self.in_flight.get(&run_id) {
                token.cancel();
            }
            tracing::info!(run_id = %run_id, "cancellation requested");
        } else {
            tracing::debug!(run_id = %run_id, "cancel ignored, run already terminal");
        }
        Ok(requested)
    }

    /// Full attempt history of a run.
    pub async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<StepAttempt>, EngineError> {
        self.checkpoint.load_run(run_id).await?;
        Ok(self.checkpoint.list_attempts(run_id).await?)
    }

    /// Retry state of the run's current step, rebuilt from history.
    pub async fn retry_state(&self, run_id: Uuid) -> Result<Option<RetryState>, EngineError> {
        let run = self.checkpoint.load_run(run_id).await?;
        let definition = self.load_definition(&run.workflow).await?;
        let attempts = self.checkpoint.list_attempts(run_id).await?;
        Ok(RetryState::from_history(&run, &definition, &attempts))
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Perform at most one transition of the run and return it as persisted.
    pub async fn advance(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let _lease = self
            .leases
            .try_acquire(run_id)
            .ok_or(EngineError::LeaseConflict(run_id))?;

        let run = self.checkpoint.load_run(run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, status = %run.status, "run already terminal");
            return Ok(run);
        }

        let definition = self.load_definition(&run.workflow).await?;
        let ttl = self.lease_ttl(&definition, run.current_step_index);
        if !self.checkpoint.acquire_lease(run_id, &self.holder, ttl).await? {
            tracing::debug!(run_id = %run_id, "run leased by another orchestrator");
            return Err(EngineError::LeaseConflict(run_id));
        }

        // Reload: another holder may have moved the run before we got the lease.
        let result = match self.checkpoint.load_run(run_id).await {
            Ok(run) => self.transition(run, &definition).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.checkpoint.release_lease(run_id, &self.holder).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to release storage lease, it will expire");
        }
        result
    }

    async fn transition(&self, run: Run, definition: &WorkflowDefinition) -> Result<Run, EngineError> {
        if run.status.is_terminal() {
            return Ok(run);
        }

        if run.status == RunStatus::StepExecuting {
            return self.reconcile(run, definition).await;
        }

        if run.cancel_requested {
            return self.cancel_now(run, definition).await;
        }

        if run.status == RunStatus::StepRetryWait {
            if let Some(due) = run.next_retry_at {
                if due > Utc::now() {
                    tracing::trace!(run_id = %run.run_id, next_retry_at = %due, "retry not yet due");
                    return Ok(run);
                }
            }
        }

        match definition.step(run.current_step_index).cloned() {
            Some(step) => self.execute_step(run, definition, step).await,
            None => self.complete(run).await,
        }
    }

    async fn execute_step(
        &self,
        mut run: Run,
        definition: &WorkflowDefinition,
        step: StepSpec,
    ) -> Result<Run, EngineError> {
        let executor =
            self.executors
                .get(&step.executor_ref)
                .ok_or_else(|| EngineError::UnknownExecutor {
                    step: step.name.clone(),
                    executor_ref: step.executor_ref.clone(),
                })?;

        let attempt_number = run.current_attempt + 1;
        let timeout_ms = step.effective_timeout_ms(self.default_step_timeout_ms);

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            run.updated_at = Utc::now();
            self.checkpoint.save_run(&run).await?;
        }

        run.status = RunStatus::StepExecuting;
        run.next_retry_at = None;
        run.updated_at = Utc::now();
        self.checkpoint.save_run(&run).await?;

        self.event_bus.publish(EngineEvent::StepStarted {
            run_id: run.run_id,
            step_name: step.name.clone(),
            attempt_number,
        });

        let request = StepRequest {
            run_id: run.run_id,
            step: step.clone(),
            attempt_number,
            context: run.context.snapshot(),
            timeout_ms,
        };
        let span = tracing::info_span!(
            "conductor.step",
            run_id = %run.run_id,
            step = %step.name,
            executor = %step.executor_ref,
            attempt = attempt_number,
        );

        let started_at = Utc::now();
        let clock = Instant::now();
        let invocation = {
            let in_flight = InFlight::register(&self.in_flight, run.run_id);
            invoke(
                executor,
                request,
                Duration::from_millis(timeout_ms),
                &in_flight.token,
            )
            .instrument(span)
            .await
        };
        let window = Window {
            started_at,
            finished_at: Utc::now(),
        };
        tracing::debug!(
            run_id = %run.run_id,
            step = %step.name,
            attempt = attempt_number,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "executor returned"
        );

        match invocation {
            Invocation::Cancelled => {
                run.cancel_requested = true;
                let detail = ErrorDetail::with_code(CODE_CANCELLED, "run cancelled while the step was executing");
                self.checkpoint
                    .record_attempt(&StepAttempt {
                        error_detail: Some(detail.clone()),
                        ..step_attempt(&run, &step.name, attempt_number, window, AttemptOutcome::Cancelled)
                    })
                    .await?;
                let failure = RunFailure {
                    step_name: step.name.clone(),
                    attempt_number,
                    detail,
                };
                self.fail_run(run, Some(failure), true).await
            }
            Invocation::TimedOut => {
                let detail = ErrorDetail::with_code(
                    CODE_TIMEOUT,
                    format!("step exceeded its {timeout_ms}ms timeout"),
                );
                self.handle_failure(run, definition, &step, attempt_number, window, FailureKind::Timeout, detail)
                    .await
            }
            Invocation::Finished(outcome) => {
                let kind = RetryHandler::classify(&step, &outcome);
                match outcome {
                    StepOutcome::Success { output } => {
                        self.handle_success(run, definition, &step, attempt_number, window, output)
                            .await
                    }
                    StepOutcome::RetryableFailure { error } | StepOutcome::FatalFailure { error } => {
                        let kind = kind.unwrap_or(FailureKind::Fatal);
                        self.handle_failure(run, definition, &step, attempt_number, window, kind, error)
                            .await
                    }
                }
            }
        }
    }

    async fn handle_success(
        &self,
        mut run: Run,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        attempt_number: u32,
        window: Window,
        output: OutputDelta,
    ) -> Result<Run, EngineError> {
        let mut next_context = run.context.clone();
        if let Err(e) = next_context.apply_delta(&output) {
            tracing::warn!(
                run_id = %run.run_id,
                step = %step.name,
                error = %e,
                "step output rejected"
            );
            let detail = ErrorDetail::with_code(CODE_CONTEXT_LIMIT, e.to_string());
            return self
                .handle_failure(run, definition, step, attempt_number, window, FailureKind::Fatal, detail)
                .await;
        }

        self.checkpoint
            .record_attempt(&StepAttempt {
                output_delta: output,
                ..step_attempt(&run, &step.name, attempt_number, window, AttemptOutcome::Success)
            })
            .await?;

        run.context = next_context;
        run.current_step_index += 1;
        run.current_attempt = 0;
        run.status = RunStatus::Running;
        run.next_retry_at = None;
        run.updated_at = Utc::now();
        self.checkpoint.save_run(&run).await?;

        tracing::info!(
            run_id = %run.run_id,
            step = %step.name,
            attempt = attempt_number,
            "step succeeded"
        );
        self.event_bus.publish(EngineEvent::StepSucceeded {
            run_id: run.run_id,
            step_name: step.name.clone(),
            attempt_number,
            duration_ms: elapsed_ms(window.started_at, window.finished_at),
        });
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        mut run: Run,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        attempt_number: u32,
        window: Window,
        kind: FailureKind,
        detail: ErrorDetail,
    ) -> Result<Run, EngineError> {
        let policy = definition.retry_policy_for(step);
        match RetryHandler::decide(policy, attempt_number, kind) {
            RetryDecision::RetryAfter(delay) => {
                let outcome = if kind == FailureKind::Timeout {
                    AttemptOutcome::Timeout
                } else {
                    AttemptOutcome::RetryableFailure
                };
                self.checkpoint
                    .record_attempt(&StepAttempt {
                        error_detail: Some(detail.clone()),
                        ..step_attempt(&run, &step.name, attempt_number, window, outcome)
                    })
                    .await?;

                let next_retry_at = RetryHandler::next_retry_at(window.finished_at, delay);
                run.current_attempt = attempt_number;
                run.status = RunStatus::StepRetryWait;
                run.next_retry_at = Some(next_retry_at);
                run.updated_at = Utc::now();
                self.checkpoint.save_run(&run).await?;

                tracing::warn!(
                    run_id = %run.run_id,
                    step = %step.name,
                    attempt = attempt_number,
                    delay_ms = delay.as_millis() as u64,
                    error = %detail,
                    "step failed, retry scheduled"
                );
                self.publish_step_failed(&run, &step.name, attempt_number, &detail, Some(next_retry_at));
                Ok(run)
            }
            RetryDecision::GiveUp => {
                self.give_up(run, definition, step, attempt_number, window, detail)
                    .await
            }
        }
    }

    /// Apply the error policy to a step that has failed for good.
    async fn give_up(
        &self,
        run: Run,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        attempt_number: u32,
        window: Window,
        detail: ErrorDetail,
    ) -> Result<Run, EngineError> {
        self.checkpoint
            .record_attempt(&StepAttempt {
                error_detail: Some(detail.clone()),
                ..step_attempt(&run, &step.name, attempt_number, window, AttemptOutcome::FatalFailure)
            })
            .await?;

        match ErrorPolicyHandler::decide(step, definition) {
            ErrorAction::Continue => {
                tracing::warn!(
                    run_id = %run.run_id,
                    step = %step.name,
                    attempt = attempt_number,
                    error = %detail,
                    "step failed, skipped under continue policy"
                );
                self.publish_step_failed(&run, &step.name, attempt_number, &detail, None);
                self.skip_step(run, step, attempt_number).await
            }
            ErrorAction::Fail => {
                self.publish_step_failed(&run, &step.name, attempt_number, &detail, None);
                let failure = RunFailure {
                    step_name: step.name.clone(),
                    attempt_number,
                    detail,
                };
                self.fail_run(run, Some(failure), false).await
            }
            ErrorAction::Compensate(compensation) => {
                self.publish_step_failed(&run, &step.name, attempt_number, &detail, None);
                self.compensate(&run, step, &compensation).await?;
                let failure = RunFailure {
                    step_name: step.name.clone(),
                    attempt_number,
                    detail,
                };
                self.fail_run(run, Some(failure), false).await
            }
        }
    }

    /// Record the skip marker that follows a fatal attempt under the continue
    /// policy, then move to the next step.
    async fn skip_step(&self, mut run: Run, step: &StepSpec, fatal_attempt: u32) -> Result<Run, EngineError> {
        self.checkpoint
            .record_attempt(&step_attempt(
                &run,
                &step.name,
                fatal_attempt + 1,
                Window::instant(),
                AttemptOutcome::Skipped,
            ))
            .await?;

        run.current_step_index += 1;
        run.current_attempt = 0;
        run.status = RunStatus::Running;
        run.next_retry_at = None;
        run.updated_at = Utc::now();
        self.checkpoint.save_run(&run).await?;

        self.event_bus.publish(EngineEvent::StepSkipped {
            run_id: run.run_id,
            step_name: step.name.clone(),
        });
        Ok(run)
    }

    /// Run a compensating step once and record it.
    ///
    /// Its output is recorded but never merged into the context, and its
    /// failure does not change the run's outcome.
    async fn compensate(
        &self,
        run: &Run,
        failed_step: &StepSpec,
        compensation: &StepSpec,
    ) -> Result<(), EngineError> {
        let started_at = Utc::now();
        let (outcome, output, detail) = match self.executors.get(&compensation.executor_ref) {
            None => (
                AttemptOutcome::FatalFailure,
                OutputDelta::new(),
                Some(ErrorDetail::with_code(
                    CODE_UNKNOWN_EXECUTOR,
                    format!("no executor registered for '{}'", compensation.executor_ref),
                )),
            ),
            Some(executor) => {
                let timeout_ms = compensation.effective_timeout_ms(self.default_step_timeout_ms);
                let request = StepRequest {
                    run_id: run.run_id,
                    step: compensation.clone(),
                    attempt_number: 1,
                    context: run.context.snapshot(),
                    timeout_ms,
                };
                let span = tracing::info_span!(
                    "conductor.compensation",
                    run_id = %run.run_id,
                    step = %compensation.name,
                    compensates = %failed_step.name,
                );
                let result = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    executor.execute(request),
                )
                .instrument(span)
                .await;
                match result {
                    Ok(StepOutcome::Success { output }) => (AttemptOutcome::Success, output, None),
                    Ok(StepOutcome::RetryableFailure { error }) => {
                        (AttemptOutcome::RetryableFailure, OutputDelta::new(), Some(error))
                    }
                    Ok(StepOutcome::FatalFailure { error }) => {
                        (AttemptOutcome::FatalFailure, OutputDelta::new(), Some(error))
                    }
                    Err(_) => (
                        AttemptOutcome::Timeout,
                        OutputDelta::new(),
                        Some(ErrorDetail::with_code(
                            CODE_TIMEOUT,
                            format!("compensation exceeded its {timeout_ms}ms timeout"),
                        )),
                    ),
                }
            }
        };

        let succeeded = outcome == AttemptOutcome::Success;
        let attempt = StepAttempt {
            run_id: run.run_id,
            step_name: compensation.name.clone(),
            step_index: run.current_step_index,
            attempt_number: 1,
            role: AttemptRole::Compensation,
            started_at,
            finished_at: Some(Utc::now()),
            outcome,
            output_delta: output,
            error_detail: detail.clone(),
        };
        self.checkpoint.record_attempt(&attempt).await?;

        if succeeded {
            tracing::info!(
                run_id = %run.run_id,
                step = %failed_step.name,
                compensation = %compensation.name,
                "compensating step succeeded"
            );
        } else {
            tracing::warn!(
                run_id = %run.run_id,
                step = %failed_step.name,
                compensation = %compensation.name,
                outcome = %outcome,
                error = ?detail,
                "compensating step failed"
            );
        }
        self.event_bus.publish(EngineEvent::CompensationRan {
            run_id: run.run_id,
            step_name: failed_step.name.clone(),
            compensation: compensation.name.clone(),
            succeeded,
        });
        Ok(())
    }

    /// Act on a cancel flag found at the start of `advance`.
    async fn cancel_now(&self, run: Run, definition: &WorkflowDefinition) -> Result<Run, EngineError> {
        let failure = match definition.step(run.current_step_index) {
            Some(step) => {
                let recorded = self
                    .checkpoint
                    .step_attempts(run.run_id, run.current_step_index)
                    .await?
                    .last()
                    .map_or(0, |a| a.attempt_number);
                let attempt_number = run.current_attempt.max(recorded) + 1;
                let detail = ErrorDetail::with_code(CODE_CANCELLED, "run cancelled");
                self.checkpoint
                    .record_attempt(&StepAttempt {
                        error_detail: Some(detail.clone()),
                        ..step_attempt(
                            &run,
                            &step.name,
                            attempt_number,
                            Window::instant(),
                            AttemptOutcome::Cancelled,
                        )
                    })
                    .await?;
                RunFailure {
                    step_name: step.name.clone(),
                    attempt_number,
                    detail,
                }
            }
            None => {
                tracing::info!(run_id = %run.run_id, "cancel arrived after the last step, completing run");
                return self.complete(run).await;
            }
        };
        self.fail_run(run, Some(failure), true).await
    }

    /// Recover a run left in `StepExecuting` by a call that stopped between
    /// the history append and the run save.
    async fn reconcile(&self, mut run: Run, definition: &WorkflowDefinition) -> Result<Run, EngineError> {
        let Some(step) = definition.step(run.current_step_index).cloned() else {
            return self.complete(run).await;
        };

        let recorded = self
            .checkpoint
            .step_attempts(run.run_id, run.current_step_index)
            .await?
            .into_iter()
            .rev()
            .find(|a| a.attempt_number > run.current_attempt);

        let Some(attempt) = recorded else {
            if run.cancel_requested {
                return self.cancel_now(run, definition).await;
            }
            tracing::warn!(
                run_id = %run.run_id,
                step = %step.name,
                attempt = run.current_attempt + 1,
                "interrupted attempt left no record, executing again"
            );
            return self.execute_step(run, definition, step).await;
        };

        tracing::warn!(
            run_id = %run.run_id,
            step = %step.name,
            attempt = attempt.attempt_number,
            outcome = %attempt.outcome,
            "reconciling interrupted run from history"
        );

        let failure = RunFailure {
            step_name: step.name.clone(),
            attempt_number: attempt.attempt_number,
            detail: attempt
                .error_detail
                .clone()
                .unwrap_or_else(|| ErrorDetail::new(attempt.outcome.as_str())),
        };

        match attempt.outcome {
            AttemptOutcome::Success => {
                if let Err(e) = run.context.apply_delta(&attempt.output_delta) {
                    let failure = RunFailure {
                        detail: ErrorDetail::with_code(CODE_CONTEXT_LIMIT, e.to_string()),
                        ..failure
                    };
                    return self.fail_run(run, Some(failure), false).await;
                }
                run.current_step_index += 1;
                run.current_attempt = 0;
                run.status = RunStatus::Running;
                run.next_retry_at = None;
            }
            AttemptOutcome::Skipped => {
                run.current_step_index += 1;
                run.current_attempt = 0;
                run.status = RunStatus::Running;
                run.next_retry_at = None;
            }
            AttemptOutcome::RetryableFailure | AttemptOutcome::Timeout => {
                let delay = RetryHandler::backoff_delay(
                    definition.retry_policy_for(&step),
                    attempt.attempt_number,
                );
                let finished_at = attempt.finished_at.unwrap_or(attempt.started_at);
                run.current_attempt = attempt.attempt_number;
                run.status = RunStatus::StepRetryWait;
                run.next_retry_at = Some(RetryHandler::next_retry_at(finished_at, delay));
            }
            AttemptOutcome::FatalFailure => {
                return match ErrorPolicyHandler::decide(&step, definition) {
                    ErrorAction::Continue => self.skip_step(run, &step, attempt.attempt_number).await,
                    ErrorAction::Fail => self.fail_run(run, Some(failure), false).await,
                    ErrorAction::Compensate(compensation) => {
                        if !self
                            .checkpoint
                            .has_compensation(run.run_id, run.current_step_index)
                            .await?
                        {
                            self.compensate(&run, &step, &compensation).await?;
                        }
                        self.fail_run(run, Some(failure), false).await
                    }
                };
            }
            AttemptOutcome::Cancelled => {
                return self.fail_run(run, Some(failure), true).await;
            }
        }

        run.updated_at = Utc::now();
        self.checkpoint.save_run(&run).await?;
        Ok(run)
    }

    async fn complete(&self, mut run: Run) -> Result<Run, EngineError> {
        run.status = RunStatus::Completed;
        run.current_attempt = 0;
        run.next_retry_at = None;
        run.updated_at = Utc::now();
        self.checkpoint.save_run(&run).await?;

        let duration_ms = elapsed_ms(run.created_at, run.updated_at);
        tracing::info!(run_id = %run.run_id, duration_ms, "workflow run completed");
        self.event_bus.publish(EngineEvent::RunCompleted {
            run_id: run.run_id,
            duration_ms,
        });
        Ok(run)
    }

    async fn fail_run(
        &self,
        mut run: Run,
        failure: Option<RunFailure>,
        cancelled: bool,
    ) -> Result<Run, EngineError> {
        if let Some(f) = &failure {
            run.current_attempt = f.attempt_number;
        }
        run.status = RunStatus::Failed;
        run.next_retry_at = None;
        run.last_error = failure.clone();
        run.updated_at = Utc::now();
        self.checkpoint.save_run(&run).await?;

        match &failure {
            Some(f) => tracing::error!(run_id = %run.run_id, cancelled, failure = %f, "workflow run failed"),
            None => tracing::error!(run_id = %run.run_id, cancelled, "workflow run failed"),
        }
        self.event_bus.publish(EngineEvent::RunFailed {
            run_id: run.run_id,
            failure,
            cancelled,
        });
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load_definition(&self, workflow: &WorkflowRef) -> Result<WorkflowDefinition, EngineError> {
        self.checkpoint
            .load_definition(workflow)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(workflow.clone()))
    }

    /// Storage lease lifetime for an advance at `step_index`: the step's
    /// timeout, plus its compensation's, plus a grace period.
    fn lease_ttl(&self, definition: &WorkflowDefinition, step_index: usize) -> Duration {
        let calls_ms = definition.step(step_index).map_or(0, |step| {
            let compensation_ms = match definition.error_policy_for(step) {
                ErrorPolicy::Compensate { step: compensation } => {
                    compensation.effective_timeout_ms(self.default_step_timeout_ms)
                }
                _ => 0,
            };
            step.effective_timeout_ms(self.default_step_timeout_ms)
                .saturating_add(compensation_ms)
        });
        Duration::from_millis(calls_ms) + STORE_LEASE_GRACE
    }

    fn ensure_executors(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        for step in &definition.steps {
            let mut refs = vec![step];
            if let ErrorPolicy::Compensate { step: compensation } = definition.error_policy_for(step) {
                refs.push(compensation.as_ref());
            }
            for spec in refs {
                if !self.executors.contains(&spec.executor_ref) {
                    return Err(EngineError::UnknownExecutor {
                        step: spec.name.clone(),
                        executor_ref: spec.executor_ref.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn publish_step_failed(
        &self,
        run: &Run,
        step_name: &str,
        attempt_number: u32,
        detail: &ErrorDetail,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        self.event_bus.publish(EngineEvent::StepFailed {
            run_id: run.run_id,
            step_name: step_name.to_string(),
            attempt_number,
            error: detail.to_string(),
            will_retry: next_retry_at.is_some(),
            next_retry_at,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use conductor_types::workflow::RetryPolicy;
    use serde_json::json;

    use crate::repository::memory::InMemoryStore;
    use crate::workflow::testing::{
        FlakyStore, Gate, Scripted, Sleepy, delta, definition, drive_to_end, fast_retry, registry,
    };

    type MemOrchestrator = Orchestrator<InMemoryStore, InMemoryStore>;

    async fn orchestrator(def: &WorkflowDefinition, registry: ExecutorRegistry) -> MemOrchestrator {
        let store = InMemoryStore::new();
        let orch = Orchestrator::new(store.clone(), store, registry, EventBus::new(64));
        orch.register_definition(def).await.unwrap();
        orch
    }

    fn ok(pairs: &[(&str, serde_json::Value)]) -> StepOutcome {
        StepOutcome::success(delta(pairs))
    }

    fn transient(msg: &str) -> StepOutcome {
        StepOutcome::retryable(ErrorDetail::with_code("transient", msg))
    }

    fn rejected(msg: &str) -> StepOutcome {
        StepOutcome::fatal(ErrorDetail::with_code("rejected", msg))
    }

    // -------------------------------------------------------------------
    // Happy path
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_three_steps_complete_in_order() {
        let def = definition(vec![
            StepSpec::new("fetch", "fetch"),
            StepSpec::new("score", "score"),
            StepSpec::new("render", "render"),
        ]);
        let fetch = Scripted::always(ok(&[("document", json!("text"))]));
        let score = Scripted::always(ok(&[("score", json!(0.8))]));
        let render = Scripted::always(ok(&[("html", json!("<p>text</p>"))]));
        let registry = ExecutorRegistry::new()
            .with("fetch", fetch.clone())
            .with("score", score.clone())
            .with("render", render.clone());
        let orch = orchestrator(&def, registry).await;

        let mut initial = ExecutionContext::new();
        initial.insert("document_id", json!("doc-1"));
        let run_id = orch.start_run(&def.workflow_ref(), initial).await.unwrap();

        let first = orch.advance(run_id).await.unwrap();
        assert_eq!(first.status, RunStatus::Running);
        assert_eq!(first.current_step_index, 1);

        let run = drive_to_end(&orch, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context.get("document_id"), Some(&json!("doc-1")));
        assert_eq!(run.context.get("score"), Some(&json!(0.8)));
        assert_eq!(run.context.get("html"), Some(&json!("<p>text</p>")));

        let attempts = orch.list_attempts(run_id).await.unwrap();
        let summary: Vec<(&str, AttemptOutcome)> = attempts
            .iter()
            .map(|a| (a.step_name.as_str(), a.outcome))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("fetch", AttemptOutcome::Success),
                ("score", AttemptOutcome::Success),
                ("render", AttemptOutcome::Success),
            ]
        );
        assert_eq!(attempts[1].output_delta, delta(&[("score", json!(0.8))]));
    }

    #[tokio::test]
    async fn test_executors_see_context_from_earlier_steps() {
        let def = definition(vec![StepSpec::new("a", "a"), StepSpec::new("b", "b")]);
        let a = Scripted::always(ok(&[("from_a", json!(1))]));
        let b = Scripted::always(ok(&[]));
        let orch = orchestrator(
            &def,
            ExecutorRegistry::new().with("a", a.clone()).with("b", b.clone()),
        )
        .await;

        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();
        drive_to_end(&orch, run_id).await;

        assert!(!a.requests()[0].context.contains_key("from_a"));
        let seen = &b.requests()[0];
        assert_eq!(seen.context.get("from_a"), Some(&json!(1)));
        assert_eq!(seen.attempt_number, 1);
        assert_eq!(seen.timeout_ms, DEFAULT_STEP_TIMEOUT_MS);
    }

    #[tokio::test]
    async fn test_terminal_runs_are_idempotent() {
        let def = definition(vec![StepSpec::new("only", "only")]);
        let only = Scripted::always(ok(&[("k", json!("v"))]));
        let orch = orchestrator(&def, ExecutorRegistry::new().with("only", only.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let done = drive_to_end(&orch, run_id).await;
        assert_eq!(done.status, RunStatus::Completed);

        for _ in 0..3 {
            let again = orch.advance(run_id).await.unwrap();
            assert_eq!(again, done);
        }
        assert_eq!(only.calls(), 1);
        assert_eq!(orch.list_attempts(run_id).await.unwrap().len(), 1);
    }

    // -------------------------------------------------------------------
    // Retries
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_retries_then_succeeds_with_gap_free_attempts() {
        let def = definition(vec![StepSpec::new("score", "score")]);
        let score = Scripted::new(
            [transient("429"), transient("503")],
            ok(&[("score", json!(3))]),
        );
        let orch = orchestrator(&def, registry("score", score.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = drive_to_end(&orch, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);

        let numbers: Vec<u32> = orch
            .list_attempts(run_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        let seen: Vec<u32> = score.requests().iter().map(|r| r.attempt_number).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_backoff_doubles_then_gives_up_on_fourth_failure() {
        let def = definition(vec![StepSpec::new("score", "score")]);
        let score = Scripted::always(transient("overloaded"));
        let orch = orchestrator(&def, registry("score", score.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let mut gaps = Vec::new();
        loop {
            let run = orch.advance(run_id).await.unwrap();
            if run.status.is_terminal() {
                break;
            }
            assert_eq!(run.status, RunStatus::StepRetryWait);
            let attempts = orch.list_attempts(run_id).await.unwrap();
            let latest = attempts.last().unwrap();
            let next = run.next_retry_at.unwrap();
            let finished = latest.finished_at.unwrap();
            assert!(next > finished);
            gaps.push((next - finished).num_milliseconds());
            tokio::time::sleep((next - Utc::now()).to_std().unwrap_or_default()).await;
        }

        let base = fast_retry().base_delay_ms as i64;
        assert_eq!(gaps, vec![base, base * 2, base * 4]);

        let run = orch.checkpoint().load_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.last_error.unwrap();
        assert_eq!(failure.step_name, "score");
        assert_eq!(failure.attempt_number, 4);
        assert_eq!(failure.detail.code.as_deref(), Some("transient"));

        let outcomes: Vec<AttemptOutcome> = orch
            .list_attempts(run_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::RetryableFailure,
                AttemptOutcome::RetryableFailure,
                AttemptOutcome::RetryableFailure,
                AttemptOutcome::FatalFailure,
            ]
        );
        assert_eq!(score.calls(), 4);
    }

    #[tokio::test]
    async fn test_advance_before_retry_is_due_does_nothing() {
        let mut def = definition(vec![StepSpec::new("score", "score")]);
        def.default_retry_policy = RetryPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..RetryPolicy::default()
        };
        let score = Scripted::always(transient("busy"));
        let orch = orchestrator(&def, registry("score", score.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let waiting = orch.advance(run_id).await.unwrap();
        assert_eq!(waiting.status, RunStatus::StepRetryWait);

        let again = orch.advance(run_id).await.unwrap();
        assert_eq!(again, waiting);
        assert_eq!(score.calls(), 1);

        let state = orch.retry_state(run_id).await.unwrap().unwrap();
        assert_eq!(state.attempts_so_far, 1);
        assert_eq!(state.next_retry_at, waiting.next_retry_at);
    }

    #[tokio::test]
    async fn test_listed_fatal_code_skips_retries() {
        let def = definition(vec![
            StepSpec::new("score", "score").with_fatal_error_codes(["invalid_input"]),
        ]);
        let score = Scripted::always(StepOutcome::retryable(ErrorDetail::with_code(
            "invalid_input",
            "unparseable document",
        )));
        let orch = orchestrator(&def, registry("score", score.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().attempt_number, 1);
        assert_eq!(score.calls(), 1);
    }

    // -------------------------------------------------------------------
    // Error policies
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_continue_policy_skips_failed_step() {
        let def = definition(vec![
            StepSpec::new("a", "a"),
            StepSpec::new("b", "b").with_on_error(ErrorPolicy::Continue),
            StepSpec::new("c", "c"),
        ]);
        let registry = ExecutorRegistry::new()
            .with("a", Scripted::always(ok(&[("a", json!(true))])))
            .with("b", Scripted::always(rejected("nope")))
            .with("c", Scripted::always(ok(&[("c", json!(true))])));
        let orch = orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = drive_to_end(&orch, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.context.contains_key("a"));
        assert!(run.context.contains_key("c"));
        assert!(!run.context.contains_key("b"));

        let attempts = orch.list_attempts(run_id).await.unwrap();
        let summary: Vec<(&str, AttemptOutcome)> = attempts
            .iter()
            .map(|a| (a.step_name.as_str(), a.outcome))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", AttemptOutcome::Success),
                ("b", AttemptOutcome::FatalFailure),
                ("b", AttemptOutcome::Skipped),
                ("c", AttemptOutcome::Success),
            ]
        );
        assert_eq!(attempts[1].attempt_number, 1);
        assert_eq!(attempts[1].error_detail.as_ref().unwrap().message, "nope");
        assert_eq!(attempts[2].attempt_number, 2);
        assert!(attempts[2].error_detail.is_none());
        assert!(attempts[2].output_delta.is_empty());
    }

    #[tokio::test]
    async fn test_fail_policy_stops_the_run() {
        let def = definition(vec![
            StepSpec::new("a", "a"),
            StepSpec::new("b", "b"),
            StepSpec::new("c", "c"),
        ]);
        let c = Scripted::always(ok(&[]));
        let registry = ExecutorRegistry::new()
            .with("a", Scripted::always(ok(&[])))
            .with("b", Scripted::always(rejected("bad input")))
            .with("c", c.clone());
        let orch = orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = drive_to_end(&orch, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(c.calls(), 0);

        let status = orch.get_run_status(run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.current_step.as_deref(), Some("b"));
        let failure = status.last_error.unwrap();
        assert_eq!(failure.step_name, "b");
        assert_eq!(failure.attempt_number, 1);
        assert_eq!(failure.detail.message, "bad input");
    }

    #[tokio::test]
    async fn test_compensate_policy_runs_compensation_once_then_fails() {
        let def = definition(vec![
            StepSpec::new("reserve", "reserve"),
            StepSpec::new("charge", "charge").with_on_error(ErrorPolicy::Compensate {
                step: Box::new(StepSpec::new("release", "release")),
            }),
        ]);
        let release = Scripted::always(ok(&[("released", json!(true))]));
        let registry = ExecutorRegistry::new()
            .with("reserve", Scripted::always(ok(&[("slot", json!(7))])))
            .with("charge", Scripted::always(rejected("card declined")))
            .with("release", release.clone());
        let orch = orchestrator(&def, registry).await;
        let mut events = orch.event_bus().subscribe();
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = drive_to_end(&orch, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.as_ref().unwrap().step_name, "charge");
        assert!(!run.context.contains_key("released"));
        assert_eq!(release.calls(), 1);
        assert_eq!(release.requests()[0].context.get("slot"), Some(&json!(7)));

        let attempts = orch.list_attempts(run_id).await.unwrap();
        let comp = attempts.iter().find(|a| a.is_compensation()).unwrap();
        assert_eq!(comp.step_name, "release");
        assert_eq!(comp.step_index, 1);
        assert_eq!(comp.outcome, AttemptOutcome::Success);

        let mut saw_compensation = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::CompensationRan { succeeded, .. } = event {
                saw_compensation = succeeded;
            }
        }
        assert!(saw_compensation);
    }

    #[tokio::test]
    async fn test_failed_compensation_still_fails_run() {
        let def = definition(vec![StepSpec::new("charge", "charge").with_on_error(
            ErrorPolicy::Compensate {
                step: Box::new(StepSpec::new("refund", "refund")),
            },
        )]);
        let registry = ExecutorRegistry::new()
            .with("charge", Scripted::always(rejected("declined")))
            .with("refund", Scripted::always(rejected("refund api down")));
        let orch = orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().detail.message, "declined");

        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].role, AttemptRole::Compensation);
        assert_eq!(attempts[1].outcome, AttemptOutcome::FatalFailure);
    }

    // -------------------------------------------------------------------
    // Timeouts and context limits
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_timeout_is_retried_then_fatal() {
        let def = definition(vec![
            StepSpec::new("slow", "slow")
                .with_timeout_ms(20)
                .with_retry(RetryPolicy {
                    max_attempts: 1,
                    ..fast_retry()
                }),
        ]);
        let slow = Sleepy::new(Duration::from_millis(500), ok(&[("late", json!(true))]));
        let orch = orchestrator(&def, registry("slow", slow)).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = drive_to_end(&orch, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.context.contains_key("late"));
        assert_eq!(run.last_error.unwrap().detail.code.as_deref(), Some(CODE_TIMEOUT));

        let outcomes: Vec<AttemptOutcome> = orch
            .list_attempts(run_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(outcomes, vec![AttemptOutcome::Timeout, AttemptOutcome::FatalFailure]);
    }

    #[tokio::test]
    async fn test_oversized_output_fails_with_context_limit() {
        let def = definition(vec![StepSpec::new("dump", "dump")]);
        let huge = "z".repeat(conductor_types::context::MAX_DELTA_SIZE + 1);
        let orch = orchestrator(
            &def,
            registry("dump", Scripted::always(ok(&[("blob", json!(huge))]))),
        )
        .await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.context.is_empty());
        assert_eq!(
            run.last_error.unwrap().detail.code.as_deref(),
            Some(CODE_CONTEXT_LIMIT)
        );
    }

    // -------------------------------------------------------------------
    // Concurrency and cancellation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_advance_yields_one_transition_and_one_conflict() {
        let def = definition(vec![StepSpec::new("gate", "gate"), StepSpec::new("next", "next")]);
        let gate = Gate::new();
        let registry = ExecutorRegistry::new()
            .with("gate", gate.clone())
            .with("next", Scripted::always(ok(&[])));
        let orch = Arc::new(orchestrator(&def, registry).await);
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.advance(run_id).await })
        };
        gate.wait_entered().await;

        let second = orch.advance(run_id).await;
        assert!(matches!(second, Err(EngineError::LeaseConflict(id)) if id == run_id));

        gate.release();
        let run = first.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(gate.calls(), 1);
        assert_eq!(orch.list_attempts(run_id).await.unwrap().len(), 1);
        assert!(!orch.leases().is_held(&run_id));
    }

    #[tokio::test]
    async fn test_cancel_before_advance_fails_without_invoking() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let a = Scripted::always(ok(&[]));
        let orch = orchestrator(&def, registry("a", a.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        assert!(orch.cancel_run(run_id).await.unwrap());
        let run = orch.advance(run_id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(a.calls(), 0);
        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Cancelled);
        assert_eq!(attempts[0].attempt_number, 1);

        assert!(!orch.cancel_run(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_during_retry_wait() {
        let mut def = definition(vec![StepSpec::new("a", "a")]);
        def.default_retry_policy.base_delay_ms = 60_000;
        def.default_retry_policy.max_delay_ms = 60_000;
        let orch = orchestrator(
            &def,
            registry("a", Scripted::always(transient("busy"))),
        )
        .await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        assert_eq!(orch.advance(run_id).await.unwrap().status, RunStatus::StepRetryWait);
        orch.cancel_run(run_id).await.unwrap();
        let run = orch.advance(run_id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].attempt_number, 2);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_step() {
        let def = definition(vec![StepSpec::new("gate", "gate")]);
        let gate = Gate::new();
        let orch = Arc::new(orchestrator(&def, registry("gate", gate.clone())).await);
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let advancing = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.advance(run_id).await })
        };
        gate.wait_entered().await;

        assert!(orch.cancel_run(run_id).await.unwrap());
        let run = advancing.await.unwrap().unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.cancel_requested);
        let failure = run.last_error.unwrap();
        assert_eq!(failure.detail.code.as_deref(), Some(CODE_CANCELLED));
        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Cancelled);
    }

    // -------------------------------------------------------------------
    // Storage failures and recovery
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_history_outage_does_not_advance_run() {
        let def = definition(vec![StepSpec::new("a", "a"), StepSpec::new("b", "b")]);
        let store = FlakyStore::new();
        let a = Scripted::always(ok(&[("a", json!(1))]));
        let registry = ExecutorRegistry::new()
            .with("a", a.clone())
            .with("b", Scripted::always(ok(&[])));
        let orch = Orchestrator::new(store.clone(), store.clone(), registry, EventBus::new(16));
        orch.register_definition(&def).await.unwrap();
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        store.fail_appends(true);
        let err = orch.advance(run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        let stuck = orch.checkpoint().load_run(run_id).await.unwrap();
        assert_eq!(stuck.current_step_index, 0);
        assert!(stuck.context.is_empty());
        assert!(!orch.leases().is_held(&run_id));

        store.fail_appends(false);
        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.current_step_index, 1);
        assert_eq!(a.calls(), 2);
        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn test_interrupted_save_is_reconciled_from_history() {
        let def = definition(vec![StepSpec::new("a", "a"), StepSpec::new("b", "b")]);
        let store = FlakyStore::new();
        let a = Scripted::always(ok(&[("a", json!("done"))]));
        let registry = registry("a", a.clone())
            .with("b", Scripted::always(ok(&[])));
        let orch = Orchestrator::new(store.clone(), store.clone(), registry, EventBus::new(16));
        orch.register_definition(&def).await.unwrap();
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        // The Running and StepExecuting saves succeed, the one after the append fails.
        store.fail_saves_after(2);
        assert!(orch.advance(run_id).await.is_err());
        let stuck = orch.checkpoint().load_run(run_id).await.unwrap();
        assert_eq!(stuck.status, RunStatus::StepExecuting);

        store.fail_saves_after(usize::MAX);
        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(run.context.get("a"), Some(&json!("done")));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_retry_is_reconciled_into_wait() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let store = FlakyStore::new();
        let registry = registry("a", Scripted::always(transient("busy")));
        let orch = Orchestrator::new(store.clone(), store.clone(), registry, EventBus::new(16));
        orch.register_definition(&def).await.unwrap();
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        store.fail_saves_after(2);
        assert!(orch.advance(run_id).await.is_err());
        store.fail_saves_after(usize::MAX);

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::StepRetryWait);
        assert_eq!(run.current_attempt, 1);
        let state = orch.retry_state(run_id).await.unwrap().unwrap();
        assert_eq!(state.next_retry_at, run.next_retry_at);
    }

    async fn flaky_orchestrator(
        def: &WorkflowDefinition,
        registry: ExecutorRegistry,
    ) -> (Orchestrator<FlakyStore, FlakyStore>, FlakyStore) {
        let store = FlakyStore::new();
        let orch = Orchestrator::new(store.clone(), store.clone(), registry, EventBus::new(16));
        orch.register_definition(def).await.unwrap();
        (orch, store)
    }

    fn charge_with_release() -> WorkflowDefinition {
        definition(vec![StepSpec::new("charge", "charge").with_on_error(
            ErrorPolicy::Compensate {
                step: Box::new(StepSpec::new("release", "release")),
            },
        )])
    }

    fn compensations(attempts: &[StepAttempt]) -> usize {
        attempts.iter().filter(|a| a.is_compensation()).count()
    }

    #[tokio::test]
    async fn test_interrupted_skip_moves_to_next_step() {
        let def = definition(vec![
            StepSpec::new("b", "b").with_on_error(ErrorPolicy::Continue),
            StepSpec::new("c", "c"),
        ]);
        let b = Scripted::always(rejected("nope"));
        let registry = registry("b", b.clone()).with("c", Scripted::always(ok(&[])));
        let (orch, store) = flaky_orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        store.fail_saves_after(2);
        assert!(orch.advance(run_id).await.is_err());
        store.fail_saves_after(usize::MAX);

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(b.calls(), 1);

        let outcomes: Vec<AttemptOutcome> = orch
            .list_attempts(run_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(outcomes, vec![AttemptOutcome::FatalFailure, AttemptOutcome::Skipped]);
        assert_eq!(drive_to_end(&orch, run_id).await.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_lost_skip_marker_is_written_on_reconcile() {
        let def = definition(vec![
            StepSpec::new("b", "b").with_on_error(ErrorPolicy::Continue),
            StepSpec::new("c", "c"),
        ]);
        let b = Scripted::always(rejected("nope"));
        let registry = registry("b", b.clone()).with("c", Scripted::always(ok(&[])));
        let (orch, store) = flaky_orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        // The fatal attempt is recorded, the skip marker is not.
        store.fail_appends_after(1);
        assert!(orch.advance(run_id).await.is_err());
        store.fail_appends(false);

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(b.calls(), 1);

        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Skipped);
        assert_eq!(attempts[1].attempt_number, 2);
    }

    #[tokio::test]
    async fn test_missing_compensation_runs_on_reconcile() {
        let def = charge_with_release();
        let release = Scripted::always(ok(&[]));
        let registry = registry("charge", Scripted::always(rejected("card declined")))
            .with("release", release.clone());
        let (orch, store) = flaky_orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        // The fatal attempt is recorded, the compensation record is lost.
        store.fail_appends_after(1);
        assert!(orch.advance(run_id).await.is_err());
        store.fail_appends(false);

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().detail.message, "card declined");
        assert_eq!(release.calls(), 2);
        assert_eq!(compensations(&orch.list_attempts(run_id).await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_recorded_compensation_is_not_repeated() {
        let def = charge_with_release();
        let release = Scripted::always(ok(&[]));
        let registry = registry("charge", Scripted::always(rejected("card declined")))
            .with("release", release.clone());
        let (orch, store) = flaky_orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        // Both records land, the final Failed save does not.
        store.fail_saves_after(2);
        assert!(orch.advance(run_id).await.is_err());
        let stuck = orch.checkpoint().load_run(run_id).await.unwrap();
        assert_eq!(stuck.status, RunStatus::StepExecuting);
        store.fail_saves_after(usize::MAX);

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().step_name, "charge");
        assert_eq!(release.calls(), 1);
        assert_eq!(compensations(&orch.list_attempts(run_id).await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_interrupted_fatal_still_compensates() {
        let def = charge_with_release();
        let release = Scripted::always(ok(&[]));
        let registry = registry("charge", Scripted::always(rejected("card declined")))
            .with("release", release.clone());
        let (orch, store) = flaky_orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        store.fail_appends_after(1);
        assert!(orch.advance(run_id).await.is_err());
        store.fail_appends(false);
        assert!(orch.cancel_run(run_id).await.unwrap());

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.last_error.unwrap();
        assert_eq!(failure.step_name, "charge");
        assert_eq!(failure.detail.message, "card declined");

        let attempts = orch.list_attempts(run_id).await.unwrap();
        let summary: Vec<(&str, AttemptOutcome, AttemptRole)> = attempts
            .iter()
            .map(|a| (a.step_name.as_str(), a.outcome, a.role))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("charge", AttemptOutcome::FatalFailure, AttemptRole::Step),
                ("release", AttemptOutcome::Success, AttemptRole::Compensation),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_after_lost_attempt_does_not_execute_again() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let a = Scripted::always(ok(&[("a", json!(1))]));
        let (orch, store) = flaky_orchestrator(&def, registry("a", a.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        store.fail_appends(true);
        assert!(orch.advance(run_id).await.is_err());
        store.fail_appends(false);
        orch.cancel_run(run_id).await.unwrap();

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().detail.code.as_deref(), Some(CODE_CANCELLED));
        assert_eq!(a.calls(), 1);
        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_interrupted_cancel_is_reconciled() {
        let def = definition(vec![StepSpec::new("gate", "gate")]);
        let gate = Gate::new();
        let (orch, store) = flaky_orchestrator(&def, registry("gate", gate.clone())).await;
        let orch = Arc::new(orch);
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        // Running and StepExecuting are saved; the Failed save after the
        // cancelled attempt is lost.
        store.fail_saves_after(2);
        let advancing = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.advance(run_id).await })
        };
        gate.wait_entered().await;
        orch.cancel_run(run_id).await.unwrap();
        assert!(advancing.await.unwrap().is_err());
        store.fail_saves_after(usize::MAX);

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().detail.code.as_deref(), Some(CODE_CANCELLED));
        assert_eq!(gate.calls(), 1);
        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_first_advance_marks_run_running() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let a = Scripted::always(ok(&[]));
        let (orch, store) = flaky_orchestrator(&def, registry("a", a.clone())).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        // Only the Pending -> Running save goes through.
        store.fail_saves_after(1);
        assert!(orch.advance(run_id).await.is_err());
        let stored = orch.checkpoint().load_run(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(a.calls(), 0);

        store.fail_saves_after(usize::MAX);
        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.current_step_index, 1);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_last_step_completes_run() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let orch = orchestrator(&def, registry("a", Scripted::always(ok(&[])))).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_step_index, 1);

        assert!(orch.cancel_run(run_id).await.unwrap());
        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.last_error.is_none());
        assert_eq!(orch.list_attempts(run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orchestrators_sharing_a_store_exclude_each_other() {
        let def = definition(vec![StepSpec::new("gate", "gate")]);
        let gate = Gate::new();
        let store = InMemoryStore::new();
        let first = Arc::new(Orchestrator::new(
            store.clone(),
            store.clone(),
            registry("gate", gate.clone()),
            EventBus::new(16),
        ));
        let second = Orchestrator::new(
            store.clone(),
            store.clone(),
            registry("gate", gate.clone()),
            EventBus::new(16),
        );
        assert_ne!(first.holder_id(), second.holder_id());
        first.register_definition(&def).await.unwrap();
        let run_id = first.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let advancing = {
            let first = Arc::clone(&first);
            tokio::spawn(async move { first.advance(run_id).await })
        };
        gate.wait_entered().await;

        let before = store.get_run(&run_id).await.unwrap().unwrap();
        let err = second.advance(run_id).await.unwrap_err();
        assert!(err.is_lease_conflict());
        assert_eq!(store.get_run(&run_id).await.unwrap().unwrap(), before);
        assert_eq!(gate.calls(), 1);

        gate.release();
        let run = advancing.await.unwrap().unwrap();
        assert_eq!(run.current_step_index, 1);
        assert_eq!(store.list_attempts(&run_id).await.unwrap().len(), 1);

        // Released after the first advance, so the second can finish the run.
        let run = second.advance(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    // -------------------------------------------------------------------
    // Lifecycle API
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_run_rejects_unknown_workflow_and_executor() {
        let def = definition(vec![StepSpec::new("a", "a").with_on_error(ErrorPolicy::Compensate {
            step: Box::new(StepSpec::new("undo", "undo")),
        })]);
        let orch = orchestrator(&def, registry("a", Scripted::always(ok(&[])))).await;

        let err = orch
            .start_run(&WorkflowRef::new("missing", 1), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));

        let err = orch
            .start_run(&def.workflow_ref(), ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownExecutor { ref executor_ref, .. } if executor_ref == "undo"
        ));
    }

    #[tokio::test]
    async fn test_register_definition_rejects_duplicates_and_invalid() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let orch = orchestrator(&def, ExecutorRegistry::new()).await;

        assert!(matches!(
            orch.register_definition(&def).await,
            Err(EngineError::DefinitionExists(_))
        ));

        let mut empty = definition(vec![]);
        empty.version = 2;
        assert!(matches!(
            orch.register_definition(&empty).await,
            Err(EngineError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_run_is_reported() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let orch = orchestrator(&def, ExecutorRegistry::new()).await;
        let missing = Uuid::now_v7();

        assert!(matches!(orch.advance(missing).await, Err(EngineError::RunNotFound(_))));
        assert!(matches!(orch.cancel_run(missing).await, Err(EngineError::RunNotFound(_))));
        assert!(matches!(
            orch.get_run_status(missing).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_view_tracks_progress() {
        let def = definition(vec![StepSpec::new("a", "a"), StepSpec::new("b", "b")]);
        let registry = ExecutorRegistry::new()
            .with("a", Scripted::always(ok(&[])))
            .with("b", Scripted::always(ok(&[])));
        let orch = orchestrator(&def, registry).await;
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();

        let view = orch.get_run_status(run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Pending);
        assert_eq!(view.current_step.as_deref(), Some("a"));

        orch.advance(run_id).await.unwrap();
        let view = orch.get_run_status(run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Running);
        assert_eq!(view.current_step.as_deref(), Some("b"));
        assert_eq!(view.attempt, 0);

        drive_to_end(&orch, run_id).await;
        let view = orch.get_run_status(run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Completed);
        assert!(view.current_step.is_none());
        assert!(view.last_error.is_none());
    }

    #[tokio::test]
    async fn test_events_follow_the_run() {
        let def = definition(vec![
            StepSpec::new("a", "a"),
            StepSpec::new("b", "b").with_on_error(ErrorPolicy::Continue),
        ]);
        let registry = ExecutorRegistry::new()
            .with("a", Scripted::always(ok(&[])))
            .with("b", Scripted::always(rejected("skip me")));
        let orch = orchestrator(&def, registry).await;
        let mut rx = orch.event_bus().subscribe();
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();
        drive_to_end(&orch, run_id).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), run_id);
            kinds.push(match event {
                EngineEvent::RunStarted { .. } => "run_started",
                EngineEvent::StepStarted { .. } => "step_started",
                EngineEvent::StepSucceeded { .. } => "step_succeeded",
                EngineEvent::StepFailed { will_retry: false, .. } => "step_failed",
                EngineEvent::StepFailed { .. } => "step_retrying",
                EngineEvent::StepSkipped { .. } => "step_skipped",
                EngineEvent::CompensationRan { .. } => "compensation",
                EngineEvent::RunCompleted { .. } => "run_completed",
                EngineEvent::RunFailed { .. } => "run_failed",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "step_started",
                "step_succeeded",
                "step_started",
                "step_failed",
                "step_skipped",
                "run_completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_from_config_applies_default_timeout() {
        let def = definition(vec![StepSpec::new("a", "a")]);
        let a = Scripted::always(ok(&[]));
        let store = InMemoryStore::new();
        let config = EngineConfig {
            default_step_timeout_ms: 1_234,
            ..EngineConfig::default()
        };
        let orch = Orchestrator::from_config(
            store.clone(),
            store,
            registry("a", a.clone()),
            &config,
        );
        orch.register_definition(&def).await.unwrap();
        let run_id = orch.start_run(&def.workflow_ref(), ExecutionContext::new()).await.unwrap();
        orch.advance(run_id).await.unwrap();

        assert_eq!(a.requests()[0].timeout_ms, 1_234);
    }
}
