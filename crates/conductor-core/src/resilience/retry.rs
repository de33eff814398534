//! Retry decisions and exponential backoff.

use std::time::Duration;

use conductor_types::workflow::RetryConfig;

use crate::error::StepError;

/// Stateless retry logic. All decisions are functions of the retry config,
/// the attempt number and the error.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failed `attempt` (1-based).
    pub fn should_retry(config: &RetryConfig, attempt: u32, error: &StepError) -> bool {
        error.is_retryable() && attempt < config.max_attempts()
    }

    /// Un-jittered delay after a failed `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn base_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay_ms = config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(config.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay to wait before the next attempt.
    ///
    /// With jitter enabled the delay is drawn uniformly from
    /// `[base/2, base]`, which keeps the exponential shape while spreading
    /// out retries of concurrently failing steps.
    pub fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
        let base = Self::base_delay(config, attempt);
        if !config.jitter || base.is_zero() {
            return base;
        }
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let half = base_ms / 2;
        let spread = base_ms - half;
        let offset = if spread == 0 {
            0
        } else {
            random_u64() % (spread + 1)
        };
        Duration::from_millis(half + offset)
    }
}

fn random_u64() -> u64 {
    // A v4 UUID carries 122 random bits.
    uuid::Uuid::new_v4().as_u128() as u64
}
