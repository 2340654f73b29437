//! Test doubles shared by the engine and scheduler tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::context::OutputDelta;
use conductor_types::error::RepositoryError;
use conductor_types::history::StepAttempt;
use conductor_types::run::Run;
use conductor_types::step::{StepOutcome, StepRequest};
use conductor_types::workflow::{ErrorPolicy, RetryPolicy, StepSpec, WorkflowDefinition, WorkflowRef};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::repository::history::HistoryStore;
use crate::repository::memory::InMemoryStore;
use crate::repository::workflow::WorkflowRepository;

use super::engine::Orchestrator;
use super::executor::{ExecutorRegistry, StepExecutor};

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptState {
    queue: VecDeque<StepOutcome>,
    requests: Vec<StepRequest>,
}

/// Returns queued outcomes in order, then the fallback forever.
#[derive(Clone)]
pub struct Scripted {
    state: Arc<Mutex<ScriptState>>,
    fallback: StepOutcome,
}

impl Scripted {
    pub fn new(queue: impl IntoIterator<Item = StepOutcome>, fallback: StepOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                queue: queue.into_iter().collect(),
                requests: Vec::new(),
            })),
            fallback,
        }
    }

    pub fn always(outcome: StepOutcome) -> Self {
        Self::new([], outcome)
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl StepExecutor for Scripted {
    async fn execute(&self, request: StepRequest) -> StepOutcome {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request);
        state.queue.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Sleeps before answering.
pub struct Sleepy {
    delay: Duration,
    outcome: StepOutcome,
}

impl Sleepy {
    pub fn new(delay: Duration, outcome: StepOutcome) -> Self {
        Self { delay, outcome }
    }
}

impl StepExecutor for Sleepy {
    async fn execute(&self, _request: StepRequest) -> StepOutcome {
        tokio::time::sleep(self.delay).await;
        self.outcome.clone()
    }
}

/// Blocks inside `execute` until released, so tests can act mid-step.
#[derive(Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until some call has entered `execute`.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepExecutor for Gate {
    async fn execute(&self, _request: StepRequest) -> StepOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // notify_one stores a permit, so a waiter that arrives late still wakes.
        self.entered.notify_one();
        self.release.notified().await;
        StepOutcome::success(OutputDelta::new())
    }
}

// ---------------------------------------------------------------------------
// Storage with injectable failures
// ---------------------------------------------------------------------------

/// `InMemoryStore` wrapper whose appends and run saves can be made to fail.
///
/// Each kind of write has a budget of calls still allowed to succeed;
/// `usize::MAX` means unlimited.
#[derive(Clone)]
pub struct FlakyStore {
    inner: InMemoryStore,
    append_budget: Arc<AtomicUsize>,
    save_budget: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            append_budget: Arc::new(AtomicUsize::new(usize::MAX)),
            save_budget: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends_after(if fail { 0 } else { usize::MAX });
    }

    /// Let the next `n` history appends succeed and fail every one after.
    pub fn fail_appends_after(&self, n: usize) {
        self.append_budget.store(n, Ordering::SeqCst);
    }

    /// Let the next `n` run saves succeed and fail every one after.
    pub fn fail_saves_after(&self, n: usize) {
        self.save_budget.store(n, Ordering::SeqCst);
    }
}

fn take(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
            0 => None,
            usize::MAX => Some(usize::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

impl WorkflowRepository for FlakyStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.inner.save_definition(def).await
    }

    async fn get_definition(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.inner.get_definition(workflow).await
    }

    async fn latest_definition(
        &self,
        id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.inner.latest_definition(id).await
    }

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.inner.create_run(run).await
    }

    async fn save_run(&self, run: &Run) -> Result<(), RepositoryError> {
        if !take(&self.save_budget) {
            return Err(RepositoryError::Unavailable("injected save failure".into()));
        }
        self.inner.save_run(run).await
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        self.inner.get_run(run_id).await
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        self.inner.request_cancel(run_id).await
    }

    async fn list_runnable_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        self.inner.list_runnable_runs(now, limit).await
    }

    async fn try_acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.try_acquire_lease(run_id, holder, now, expires_at).await
    }

    async fn release_lease(&self, run_id: &Uuid, holder: &str) -> Result<(), RepositoryError> {
        self.inner.release_lease(run_id, holder).await
    }
}

impl HistoryStore for FlakyStore {
    async fn append(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        if !take(&self.append_budget) {
            return Err(RepositoryError::Unavailable("injected append failure".into()));
        }
        self.inner.append(attempt).await
    }

    async fn list_attempts(&self, run_id: &Uuid) -> Result<Vec<StepAttempt>, RepositoryError> {
        self.inner.list_attempts(run_id).await
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn delta(pairs: &[(&str, serde_json::Value)]) -> OutputDelta {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Three retries with millisecond-scale backoff: 5ms, 10ms, 20ms.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 5,
        multiplier: 2.0,
        max_delay_ms: 1_000,
    }
}

pub fn definition(steps: Vec<StepSpec>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "doc-review".to_string(),
        version: 1,
        description: None,
        steps,
        default_retry_policy: fast_retry(),
        default_error_policy: ErrorPolicy::Fail,
        metadata: HashMap::new(),
    }
}

pub fn registry<T: StepExecutor + 'static>(key: &str, executor: T) -> ExecutorRegistry {
    ExecutorRegistry::new().with(key, executor)
}

/// Advance until terminal, sleeping through retry waits.
pub async fn drive_to_end<R, H>(orch: &Orchestrator<R, H>, run_id: Uuid) -> Run
where
    R: WorkflowRepository,
    H: HistoryStore,
{
    for _ in 0..100 {
        let run = orch.advance(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        if let Some(at) = run.next_retry_at {
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        }
    }
    panic!("run {run_id} did not finish within 100 advances");
}
