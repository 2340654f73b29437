//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (conductor-infra) implements. `InMemoryStore` implements both for tests
//! and embedded use.

pub mod history;
pub mod memory;
pub mod workflow;

pub use history::HistoryStore;
pub use memory::InMemoryStore;
pub use workflow::WorkflowRepository;
