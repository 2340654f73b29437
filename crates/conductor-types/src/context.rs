//! Execution context threaded through a workflow run.
//!
//! `ExecutionContext` is plain keyed data: steps read it through an immutable
//! [`ContextSnapshot`] and contribute to it by returning an [`OutputDelta`].
//! Engine bookkeeping (status, step index, retry timing) lives on the `Run`,
//! never inside the context.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ContextError;

/// Maximum serialized size of a single step's output delta (1 MB).
pub const MAX_DELTA_SIZE: usize = 1_048_576;

/// Maximum serialized size of a whole execution context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Keys written by one successful step.
pub type OutputDelta = Map<String, Value>;

/// Mutable key/value state owned by exactly one run.
///
/// Keys are only ever added or overwritten; nothing is removed during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    entries: Map<String, Value>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from existing entries.
    pub fn from_entries(entries: Map<String, Value>) -> Self {
        Self { entries }
    }

    /// Build a context from a JSON value, which must be an object.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        match value {
            Value::Object(entries) => Ok(Self { entries }),
            _ => Err(ContextError::NotAnObject),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Insert or overwrite a single key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Merge a step's output delta into the context.
    ///
    /// Enforces `MAX_DELTA_SIZE` on the delta and `MAX_CONTEXT_SIZE` on the
    /// merged result. On error the context is left untouched.
    pub fn apply_delta(&mut self, delta: &OutputDelta) -> Result<(), ContextError> {
        let delta_size = serialized_size(delta)?;
        if delta_size > MAX_DELTA_SIZE {
            return Err(ContextError::DeltaTooLarge {
                size: delta_size,
                max: MAX_DELTA_SIZE,
            });
        }

        let mut merged = self.entries.clone();
        for (key, value) in delta {
            merged.insert(key.clone(), value.clone());
        }

        let total = serialized_size(&merged)?;
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::ContextTooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }

        self.entries = merged;
        Ok(())
    }

    /// Take an immutable snapshot to hand to a step executor.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(Arc::new(self.entries.clone()))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.entries
    }
}

fn serialized_size(map: &Map<String, Value>) -> Result<usize, ContextError> {
    serde_json::to_vec(map)
        .map(|bytes| bytes.len())
        .map_err(|e| ContextError::Serialization(e.to_string()))
}

/// Read-only view of a context at the moment a step was invoked.
///
/// Cloning is cheap (shared `Arc`), so the same snapshot can be inspected by
/// monitoring code while an executor holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot(Arc<Map<String, Value>>);

impl ContextSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl Serialize for ContextSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContextSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::deserialize(deserializer).map(|entries| Self(Arc::new(entries)))
    }
}
