//! Circuit breakers, one per capability.
//!
//! Closed -> Open after `failure_threshold` consecutive transient failures.
//! Open -> HalfOpen once the cooldown has elapsed, admitting exactly one
//! probe. A successful probe closes the circuit, a failed one reopens it.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use conductor_types::config::BreakerConfig;
use conductor_types::state::{BreakerSnapshot, CircuitStateKind};
use conductor_types::task::Capability;

/// Circuit breaker state for a capability.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward threshold.
    Closed { consecutive_failures: u32 },
    /// Failing fast until the cooldown has elapsed.
    Open {
        opened_at: Instant,
        opened_at_wall: DateTime<Utc>,
    },
    /// One probe may be in flight.
    HalfOpen { probe_in_flight: bool },
}

impl CircuitState {
    pub fn kind(&self) -> CircuitStateKind {
        match self {
            CircuitState::Closed { .. } => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }
}

/// Whether a call may go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single HalfOpen probe.
    Probe,
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Health tracking for a single capability.
#[derive(Debug)]
pub struct CircuitBreaker {
    pub capability: Capability,
    pub state: CircuitState,
    pub last_error: Option<String>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(capability: Capability, config: &BreakerConfig) -> Self {
        Self {
            capability,
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            last_error: None,
            total_calls: 0,
            total_failures: 0,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    /// Decide whether a call may proceed, moving Open -> HalfOpen when the
    /// cooldown has elapsed.
    pub fn try_acquire(&mut self) -> Admission {
        match &self.state {
            CircuitState::Closed { .. } => Admission::Allowed,
            CircuitState::Open { opened_at, .. } => {
                if opened_at.elapsed() >= self.cooldown {
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Admission::Rejected
                } else {
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Admission::Probe
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a transient failure. Returns `true` when this call opened the
    /// circuit.
    pub fn record_failure(&mut self, error: &str) -> bool {
        self.total_calls += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());

        match &self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let new_count = consecutive_failures + 1;
                if new_count >= self.failure_threshold {
                    self.open();
                    true
                } else {
                    self.state = CircuitState::Closed {
                        consecutive_failures: new_count,
                    };
                    false
                }
            }
            CircuitState::HalfOpen { .. } => {
                // Probe failed, reopen the circuit
                self.open();
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    /// Give back a probe slot whose call never reached the dependency.
    pub fn release_probe(&mut self) {
        if let CircuitState::HalfOpen {
            probe_in_flight: true,
        } = self.state
        {
            self.state = CircuitState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => consecutive_failures,
            _ => self.failure_threshold,
        }
    }

    pub fn snapshot(&self, engine_version: &str) -> BreakerSnapshot {
        let opened_at = match &self.state {
            CircuitState::Open { opened_at_wall, .. } => Some(*opened_at_wall),
            _ => None,
        };
        BreakerSnapshot {
            capability: self.capability.to_string(),
            state: self.state.kind(),
            consecutive_failures: self.consecutive_failures(),
            opened_at,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            engine_version: engine_version.to_string(),
        }
    }

    /// Rebuild from a snapshot. An Open circuit keeps the remainder of its
    /// cooldown; a HalfOpen one comes back without a probe in flight.
    pub fn restore(snapshot: &BreakerSnapshot, config: &BreakerConfig) -> Self {
        let mut breaker = Self::new(Capability::new(snapshot.capability.clone()), config);
        breaker.total_calls = snapshot.total_calls;
        breaker.total_failures = snapshot.total_failures;
        breaker.state = match snapshot.state {
            CircuitStateKind::Closed => CircuitState::Closed {
                consecutive_failures: snapshot.consecutive_failures,
            },
            CircuitStateKind::HalfOpen => CircuitState::HalfOpen {
                probe_in_flight: false,
            },
            CircuitStateKind::Open => {
                let opened_at_wall = snapshot.opened_at.unwrap_or_else(Utc::now);
                let elapsed = Utc::now()
                    .signed_duration_since(opened_at_wall)
                    .to_std()
                    .unwrap_or_default();
                let now = Instant::now();
                CircuitState::Open {
                    opened_at: now.checked_sub(elapsed).unwrap_or(now),
                    opened_at_wall,
                }
            }
        };
        breaker
    }

    fn open(&mut self) {
        self.state = CircuitState::Open {
            opened_at: Instant::now(),
            opened_at_wall: Utc::now(),
        };
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All breakers of an engine, keyed by capability.
///
/// Every transition happens under the capability's shard lock, so state
/// changes are atomic per key.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<Capability, CircuitBreaker>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn admit(&self, capability: &Capability) -> Admission {
        self.with_breaker(capability, CircuitBreaker::try_acquire)
    }

    pub fn on_success(&self, capability: &Capability) {
        self.with_breaker(capability, CircuitBreaker::record_success);
    }

    /// Returns `Some(consecutive_failures)` when this failure opened the circuit.
    pub fn on_failure(&self, capability: &Capability, error: &str) -> Option<u32> {
        self.with_breaker(capability, |b| b.record_failure(error).then_some(b.failure_threshold))
    }

    pub fn release_probe(&self, capability: &Capability) {
        self.with_breaker(capability, CircuitBreaker::release_probe);
    }

    pub fn state(&self, capability: &Capability) -> CircuitStateKind {
        self.breakers
            .get(capability)
            .map(|b| b.state.kind())
            .unwrap_or(CircuitStateKind::Closed)
    }

    pub fn snapshot(&self, engine_version: &str) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|b| b.snapshot(engine_version))
            .collect();
        snapshots.sort_by(|a, b| a.capability.cmp(&b.capability));
        snapshots
    }

    /// Restore breakers written by the same engine version. Returns how many
    /// were restored.
    pub fn restore(&self, snapshots: &[BreakerSnapshot], engine_version: &str) -> usize {
        let mut restored = 0;
        for snapshot in snapshots.iter().filter(|s| s.engine_version == engine_version) {
            let breaker = CircuitBreaker::restore(snapshot, &self.config);
            self.breakers.insert(breaker.capability.clone(), breaker);
            restored += 1;
        }
        restored
    }

    fn with_breaker<R>(&self, capability: &Capability, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breaker = self
            .breakers
            .entry(capability.clone())
            .or_insert_with(|| CircuitBreaker::new(capability.clone(), &self.config));
        f(breaker.value_mut())
    }
}
