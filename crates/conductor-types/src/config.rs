//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `conductor.toml`. Every field has
//! a default so a missing or partial file still yields a usable engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::workflow::RetryConfig;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: SchedulerConfig,
    /// Default retry policy for steps without an override.
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrently executing tasks per run.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Step timeout when a step declares none.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
    /// Maximum nesting of recursive sub-graphs.
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_max_recursion_depth() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            default_step_timeout_ms: default_step_timeout_ms(),
            max_recursion_depth: default_max_recursion_depth(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent Open before a single HalfOpen probe is allowed.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry bound of the in-process tier.
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
    /// TTL ceiling of the in-process tier.
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,
    /// Entry bound of the shared tier.
    #[serde(default = "default_shared_capacity")]
    pub shared_capacity: usize,
    /// Default TTL of the shared tier (capability overrides win).
    #[serde(default = "default_shared_ttl_secs")]
    pub shared_ttl_secs: u64,
    /// Per-capability TTL overrides, in seconds.
    #[serde(default)]
    pub capability_ttl_secs: HashMap<String, u64>,
}

fn default_local_capacity() -> usize {
    256
}

fn default_local_ttl_secs() -> u64 {
    60
}

fn default_shared_capacity() -> usize {
    4096
}

fn default_shared_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: default_local_capacity(),
            local_ttl_secs: default_local_ttl_secs(),
            shared_capacity: default_shared_capacity(),
            shared_ttl_secs: default_shared_ttl_secs(),
            capability_ttl_secs: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,
    /// How long the first task of a window waits for company.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Error rate above which the batch size shrinks.
    #[serde(default = "default_target_error_rate")]
    pub target_error_rate: f64,
    /// Batch latency above which the batch size shrinks.
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    64
}

fn default_initial_size() -> usize {
    8
}

fn default_window_ms() -> u64 {
    20
}

fn default_target_error_rate() -> f64 {
    0.1
}

fn default_target_latency_ms() -> u64 {
    500
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            initial_size: default_initial_size(),
            window_ms: default_window_ms(),
            target_error_rate: default_target_error_rate(),
            target_latency_ms: default_target_latency_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.default_concurrency, 4);
        assert_eq!(config.engine.max_recursion_depth, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.cache.local_capacity, 256);
        assert_eq!(config.batch.initial_size, 8);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let toml_str = r#"
[breaker]
failure_threshold = 2

[cache.capability_ttl_secs]
clock = 1
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.cache.capability_ttl_secs.get("clock"), Some(&1));
        assert_eq!(config.engine.default_concurrency, 4);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.batch.max_size, 64);
        assert!(config.retry.jitter);
    }
}
