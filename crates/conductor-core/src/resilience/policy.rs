//! The retrying, breaker-guarded call loop wrapped around every dispatch.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_types::event::EngineEvent;
use conductor_types::task::Capability;
use conductor_types::workflow::RetryConfig;

use super::breaker::{Admission, CircuitBreakerRegistry};
use super::retry::RetryHandler;
use crate::error::{BreakerEffect, StepError};
use crate::event::EventBus;

/// Identifies a call for logging and events.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub run_id: Uuid,
    pub step_id: String,
    pub capability: Capability,
}

/// Result of a guarded call.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: Result<T, StepError>,
    /// Attempts consumed, including fast-failed ones.
    pub attempts: u32,
}

/// Applies retry with backoff and circuit breaking around an operation.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    breakers: Arc<CircuitBreakerRegistry>,
    events: EventBus,
}

impl ResiliencePolicy {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, events: EventBus) -> Self {
        Self { breakers, events }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `op` until it succeeds, fails non-transiently, or the retry budget
    /// is exhausted.
    ///
    /// - A call rejected by an Open breaker fails fast with
    ///   `StepError::CircuitOpen` and still consumes an attempt.
    /// - Only transient failures count toward the breaker; permanent and
    ///   validation failures mean the dependency answered.
    /// - A panicking attempt is caught and counts as a breaker failure.
    /// - Cancellation is honoured between attempts and during backoff.
    pub async fn call<T, F, Fut>(
        &self,
        site: &CallSite,
        retry: &RetryConfig,
        cancel: &CancellationToken,
        op: F,
    ) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        self.call_within(site, retry, cancel, None, op).await
    }

    /// Like [`call`](Self::call), with one wall-clock limit over every
    /// attempt and backoff. Running past it fails with `StepError::Timeout`.
    pub async fn call_within<T, F, Fut>(
        &self,
        site: &CallSite,
        retry: &RetryConfig,
        cancel: &CancellationToken,
        limit: Option<Duration>,
        mut op: F,
    ) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let deadline = limit.map(|limit| (Instant::now() + limit, limit));
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return CallOutcome {
                    result: Err(StepError::Cancelled),
                    attempts: attempt,
                };
            }
            if let Some((at, limit)) = deadline {
                if Instant::now() >= at {
                    return CallOutcome {
                        result: Err(timed_out(limit)),
                        attempts: attempt,
                    };
                }
            }
            attempt += 1;

            let admission = self.breakers.admit(&site.capability);
            let result = if admission.is_admitted() {
                let guarded = AssertUnwindSafe(op(attempt)).catch_unwind();
                let caught = match deadline {
                    Some((at, limit)) => match tokio::time::timeout_at(at, guarded).await {
                        Ok(caught) => caught,
                        Err(_) => Ok(Err(timed_out(limit))),
                    },
                    None => guarded.await,
                };
                caught.unwrap_or_else(|panic| {
                    let error = StepError::from_panic(panic);
                    tracing::error!(
                        step_id = %site.step_id,
                        capability = %site.capability,
                        attempt,
                        error = %error,
                        "attempt panicked"
                    );
                    Err(error)
                })
            } else {
                tracing::debug!(
                    step_id = %site.step_id,
                    capability = %site.capability,
                    attempt,
                    "circuit open, failing fast"
                );
                Err(StepError::CircuitOpen {
                    capability: site.capability.to_string(),
                })
            };

            let error = match result {
                Ok(value) => {
                    if admission.is_admitted() {
                        self.breakers.on_success(&site.capability);
                    }
                    return CallOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            if admission.is_admitted() {
                self.record_failure(site, admission, &error);
            }

            if !RetryHandler::should_retry(retry, attempt, &error) {
                return CallOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            if let Some((at, limit)) = deadline {
                if Instant::now() >= at {
                    return CallOutcome {
                        result: Err(timed_out(limit)),
                        attempts: attempt,
                    };
                }
            }

            // Fast-failed attempts do not back off: the breaker's cooldown
            // already spaces them out.
            if matches!(error, StepError::CircuitOpen { .. }) {
                continue;
            }

            let delay = RetryHandler::backoff(retry, attempt);
            tracing::warn!(
                step_id = %site.step_id,
                capability = %site.capability,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            self.events.publish(EngineEvent::StepRetrying {
                run_id: site.run_id,
                step_id: site.step_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            let wake = Instant::now() + delay;
            let wake = deadline.map_or(wake, |(at, _)| wake.min(at));
            tokio::select! {
                _ = cancel.cancelled() => {
                    return CallOutcome {
                        result: Err(StepError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn record_failure(&self, site: &CallSite, admission: Admission, error: &StepError) {
        match error.breaker_effect() {
            BreakerEffect::Failure => {
                if let Some(consecutive_failures) =
                    self.breakers.on_failure(&site.capability, &error.to_string())
                {
                    tracing::warn!(
                        capability = %site.capability,
                        consecutive_failures,
                        "circuit opened"
                    );
                    self.events.publish(EngineEvent::CircuitOpened {
                        capability: site.capability.to_string(),
                        consecutive_failures,
                    });
                }
            }
            BreakerEffect::Healthy => self.breakers.on_success(&site.capability),
            BreakerEffect::Neutral => {
                if admission == Admission::Probe {
                    self.breakers.release_probe(&site.capability);
                }
            }
        }
    }
}

fn timed_out(limit: Duration) -> StepError {
    StepError::Timeout {
        timeout_ms: limit.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use conductor_types::config::BreakerConfig;
    use conductor_types::error::ExecutorError;
    use conductor_types::state::CircuitStateKind;

    fn policy(threshold: u32, cooldown_ms: u64) -> ResiliencePolicy {
        ResiliencePolicy::new(
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
                failure_threshold: threshold,
                cooldown_ms,
            })),
            EventBus::new(64),
        )
    }

    fn site(capability: &str) -> CallSite {
        CallSite {
            run_id: Uuid::now_v7(),
            step_id: "step".into(),
            capability: capability.into(),
        }
    }

    fn quick_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }
    }

    async fn explode() -> Result<(), StepError> {
        panic!("probe exploded")
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let p = policy(10, 60_000);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome = p
            .call(&site("analysis"), &quick_retry(3), &CancellationToken::new(), move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StepError::from(ExecutorError::transient("503")))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let p = policy(10, 60_000);
        let outcome: CallOutcome<()> = p
            .call(&site("analysis"), &quick_retry(3), &CancellationToken::new(), |_| async {
                Err::<(), StepError>(StepError::from(ExecutorError::permanent("unsupported")))
            })
            .await;
        assert!(matches!(outcome.result, Err(StepError::Executor(ExecutorError::Permanent(_)))));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_and_consumes_attempts() {
        let p = policy(2, 60_000);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome: CallOutcome<()> = p
            .call(&site("scan"), &quick_retry(4), &CancellationToken::new(), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), StepError>(StepError::from(ExecutorError::transient("down")))
            })
            .await;

        assert!(matches!(outcome.result, Err(StepError::CircuitOpen { .. })));
        assert_eq!(outcome.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.breakers().state(&"scan".into()), CircuitStateKind::Open);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let p = policy(2, 60_000);
        let token = CancellationToken::new();
        token.cancel();
        let outcome: CallOutcome<()> = p
            .call(&site("scan"), &quick_retry(2), &token, |_| async { Ok::<(), StepError>(()) })
            .await;
        assert!(matches!(outcome.result, Err(StepError::Cancelled)));
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test]
    async fn test_panicking_probe_reopens_circuit() {
        let p = policy(1, 10);
        let capability: Capability = "scan".into();
        let _: CallOutcome<()> = p
            .call(&site("scan"), &RetryConfig::none(), &CancellationToken::new(), |_| async {
                Err::<(), StepError>(StepError::from(ExecutorError::transient("down")))
            })
            .await;
        assert_eq!(p.breakers().state(&capability), CircuitStateKind::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome: CallOutcome<()> = p
            .call(&site("scan"), &RetryConfig::none(), &CancellationToken::new(), |_| explode())
            .await;
        assert!(matches!(outcome.result, Err(StepError::Panicked(ref m)) if m == "probe exploded"));
        assert_eq!(p.breakers().state(&capability), CircuitStateKind::Open);
    }

    #[tokio::test]
    async fn test_limit_bounds_retries_and_backoff() {
        let p = policy(10, 60_000);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let outcome: CallOutcome<()> = p
            .call_within(
                &site("analysis"),
                &quick_retry(5),
                &CancellationToken::new(),
                Some(Duration::from_millis(50)),
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err::<(), StepError>(StepError::from(ExecutorError::transient("slow")))
                },
            )
            .await;
        assert!(matches!(outcome.result, Err(StepError::Timeout { timeout_ms: 50 })));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_circuit_opened_event_published() {
        let p = policy(1, 60_000);
        let mut rx = p.events.subscribe();
        let _: CallOutcome<()> = p
            .call(&site("scan"), &RetryConfig::none(), &CancellationToken::new(), |_| async {
                Err::<(), StepError>(StepError::Timeout { timeout_ms: 5 })
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::CircuitOpened { ref capability, .. } if capability == "scan"));
    }
}
