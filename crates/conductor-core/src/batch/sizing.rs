//! Adaptive window sizing (additive increase, multiplicative decrease).

use std::time::Duration;

use conductor_types::config::BatchConfig;

/// Weight of the newest observation in the moving averages.
const SMOOTHING: f64 = 0.3;

/// Tracks the target batch size for one capability.
///
/// The size halves while the smoothed error rate or latency is above target
/// and grows by one while both are within target, always clamped to
/// `[min_size, max_size]`.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchSize {
    current: usize,
    min: usize,
    max: usize,
    target_error_rate: f64,
    target_latency: Duration,
    error_rate: Option<f64>,
    latency_ms: Option<f64>,
}

impl AdaptiveBatchSize {
    pub fn new(config: &BatchConfig) -> Self {
        let min = config.min_size.max(1);
        let max = config.max_size.max(min);
        Self {
            current: config.initial_size.clamp(min, max),
            min,
            max,
            target_error_rate: config.target_error_rate,
            target_latency: Duration::from_millis(config.target_latency_ms),
            error_rate: None,
            latency_ms: None,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Feed one dispatched batch; returns the new target size.
    pub fn record(&mut self, batch_len: usize, failures: usize, latency: Duration) -> usize {
        if batch_len == 0 {
            return self.current;
        }
        let error_rate = smooth(self.error_rate, failures as f64 / batch_len as f64);
        let latency_ms = smooth(self.latency_ms, latency.as_secs_f64() * 1000.0);
        self.error_rate = Some(error_rate);
        self.latency_ms = Some(latency_ms);

        let target_latency_ms = self.target_latency.as_secs_f64() * 1000.0;
        self.current = if error_rate > self.target_error_rate || latency_ms > target_latency_ms {
            (self.current / 2).max(self.min)
        } else {
            (self.current + 1).min(self.max)
        };
        self.current
    }

    pub fn error_rate(&self) -> Option<f64> {
        self.error_rate
    }
}

fn smooth(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(prev) => SMOOTHING * sample + (1.0 - SMOOTHING) * prev,
        None => sample,
    }
}
