//! Retry with backoff and per-capability circuit breaking.

pub mod breaker;
pub mod policy;
pub mod retry;

pub use breaker::{Admission, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use policy::{CallOutcome, CallSite, ResiliencePolicy};
pub use retry::RetryHandler;
