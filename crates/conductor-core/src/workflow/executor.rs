//! Step executor adapter: the uniform contract the engine calls to run a step.
//!
//! Follows the blanket-impl pattern used for other RPITIT ports:
//! 1. `StepExecutor` uses native async fn in traits
//! 2. `StepExecutorDyn` is an object-safe twin with boxed futures, blanket
//!    implemented for every `StepExecutor`
//! 3. `BoxStepExecutor` wraps `Box<dyn StepExecutorDyn>` and delegates
//!
//! `ExecutorRegistry` maps `executor_ref` keys to boxed executors.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use conductor_types::step::{StepOutcome, StepRequest};

// ---------------------------------------------------------------------------
// StepExecutor trait
// ---------------------------------------------------------------------------

/// Runs one attempt of one step.
///
/// Implementations read the request's context snapshot and return an output
/// delta; they never see or mutate the live context. Business rejections are
/// reported as `StepOutcome::FatalFailure`, transient trouble as
/// `RetryableFailure`.
///
/// The engine enforces the step timeout and may drop the returned future
/// when the run is cancelled.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepExecutor: Send + Sync {
    fn execute(&self, request: StepRequest) -> impl Future<Output = StepOutcome> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>>;
}

/// Blanket implementation: any `StepExecutor` automatically implements `StepExecutorDyn`.
impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

/// Type-erased step executor.
///
/// Since `StepExecutor` uses RPITIT, it cannot be used as a trait object
/// directly; `BoxStepExecutor` delegates to the `StepExecutorDyn` object.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn + Send + Sync>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, request: StepRequest) -> StepOutcome {
        self.inner.execute_boxed(request).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Registry of step executors, indexed by `executor_ref`.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, BoxStepExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under the given key, replacing any previous one.
    pub fn register<T: StepExecutor + 'static>(&mut self, key: impl Into<String>, executor: T) {
        self.executors
            .insert(key.into(), BoxStepExecutor::new(executor));
    }

    /// Builder-style `register`.
    pub fn with<T: StepExecutor + 'static>(mut self, key: impl Into<String>, executor: T) -> Self {
        self.register(key, executor);
        self
    }

    pub fn get(&self, key: &str) -> Option<&BoxStepExecutor> {
        self.executors.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.executors.contains_key(key)
    }

    /// List all registered keys.
    pub fn list_keys(&self) -> Vec<&str> {
        self.executors.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("keys", &self.list_keys())
            .finish()
    }
}
