//! Read-only snapshot of the context plus a proposal buffer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{Map, Value};

use conductor_types::task::Proposal;

/// What an executor sees of the shared context.
///
/// Reads come from an immutable snapshot taken when the step was scheduled.
/// Writes are buffered as proposals; the orchestrator decides when and in
/// which order they are merged into the run's `ContextStore`.
#[derive(Debug, Default)]
pub struct ContextView {
    values: BTreeMap<String, Value>,
    generation: u64,
    proposals: Mutex<Vec<Proposal>>,
}

impl ContextView {
    pub fn new(values: BTreeMap<String, Value>, generation: u64) -> Self {
        Self {
            values,
            generation,
            proposals: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn read(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Generation of the store this snapshot was taken from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// The subset of `keys` present in the snapshot.
    pub fn slice(&self, keys: &[String]) -> BTreeMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Snapshot as a JSON object, used as the expression evaluation context.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.values {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Record a proposed write. It becomes visible to dependents only after
    /// the orchestrator merges it.
    pub fn propose(&self, key: impl Into<String>, value: Value) {
        self.buffer().push(Proposal {
            key: key.into(),
            value,
        });
    }

    /// Drain buffered proposals.
    pub fn take_proposals(&self) -> Vec<Proposal> {
        std::mem::take(&mut *self.buffer())
    }

    /// Drop proposals from an abandoned attempt.
    pub fn discard_proposals(&self) {
        self.buffer().clear();
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<Proposal>> {
        self.proposals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
