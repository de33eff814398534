//! Append-only, versioned key/value store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use conductor_types::task::Proposal;

use super::view::ContextView;

/// One write to a context key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    /// Generation of the merge that produced this value (0 = initial context).
    pub generation: u64,
    /// Step that proposed the value, `None` for the initial context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_by: Option<String>,
}

/// Versioned context. Values are never overwritten in place: each merge
/// appends a new version and bumps the generation counter.
///
/// Keys are kept in a `BTreeMap` so iteration and serialization order is
/// stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStore {
    entries: BTreeMap<String, Vec<VersionedValue>>,
    generation: u64,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an initial context at generation 0.
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries = values
            .into_iter()
            .map(|(key, value)| {
                (
                    key.into(),
                    vec![VersionedValue {
                        value,
                        generation: 0,
                        written_by: None,
                    }],
                )
            })
            .collect();
        Self {
            entries,
            generation: 0,
        }
    }

    /// Build an initial context from a JSON object. Non-object values yield
    /// an empty context.
    pub fn from_json(value: &Value) -> Self {
        match value.as_object() {
            Some(map) => Self::from_values(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
            None => Self::new(),
        }
    }

    /// Number of merges applied so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Latest value of a key.
    pub fn read(&self, key: &str) -> Option<&Value> {
        self.entries
            .get(key)
            .and_then(|versions| versions.last())
            .map(|v| &v.value)
    }

    /// Every version of a key, oldest first.
    pub fn history(&self, key: &str) -> &[VersionedValue] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a step's proposals as one generation.
    ///
    /// Proposals are applied in order, so a later proposal for the same key
    /// within one batch wins. An empty batch leaves the generation unchanged.
    /// Returns the generation after the merge.
    pub fn merge(&mut self, written_by: &str, proposals: &[Proposal]) -> u64 {
        if proposals.is_empty() {
            return self.generation;
        }
        self.generation += 1;
        for proposal in proposals {
            self.entries
                .entry(proposal.key.clone())
                .or_default()
                .push(VersionedValue {
                    value: proposal.value.clone(),
                    generation: self.generation,
                    written_by: Some(written_by.to_string()),
                });
        }
        self.generation
    }

    /// Latest value of every key.
    pub fn latest(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .filter_map(|(k, versions)| versions.last().map(|v| (k.clone(), v.value.clone())))
            .collect()
    }

    /// Latest values as a JSON object with sorted keys.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in self.latest() {
            map.insert(key, value);
        }
        Value::Object(map)
    }

    /// Read-only snapshot handed to executors.
    pub fn view(&self) -> ContextView {
        ContextView::new(self.latest(), self.generation)
    }
}
