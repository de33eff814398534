//! Process-wide engine state that may outlive a process.
//!
//! These are the serializable forms of memoization cache entries and circuit
//! breaker state. Runtime tracking lives in `conductor-core`; persistence
//! adapters store and reload exactly these rows, scoped by engine version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskOutput;

/// A memoized task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hex-encoded SHA-256 fingerprint of the unit of work.
    pub fingerprint: String,
    pub value: TaskOutput,
    pub created_at: DateTime<Utc>,
    /// Time to live in milliseconds.
    pub ttl_ms: u64,
    pub engine_version: String,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl_ms = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        now.signed_duration_since(self.created_at).num_milliseconds() >= ttl_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStateKind::Closed => "closed",
            CircuitStateKind::Open => "open",
            CircuitStateKind::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitStateKind::Closed),
            "open" => Some(CircuitStateKind::Open),
            "half_open" => Some(CircuitStateKind::HalfOpen),
            _ => None,
        }
    }
}

/// Serializable subset of one capability's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub capability: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub engine_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(ttl_ms: u64) -> CacheEntry {
        CacheEntry {
            fingerprint: "abc".to_string(),
            value: TaskOutput::new(json!("v")),
            created_at: Utc::now(),
            ttl_ms,
            engine_version: crate::ENGINE_VERSION.to_string(),
        }
    }

    #[test]
    fn test_entry_expiry() {
        let e = entry(60_000);
        assert!(!e.is_expired());
        assert!(e.is_expired_at(e.created_at + Duration::seconds(61)));
        assert!(entry(0).is_expired());
    }

    #[test]
    fn test_circuit_state_roundtrip_str() {
        for kind in [
            CircuitStateKind::Closed,
            CircuitStateKind::Open,
            CircuitStateKind::HalfOpen,
        ] {
            assert_eq!(CircuitStateKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CircuitStateKind::parse("bogus"), None);
    }
}
