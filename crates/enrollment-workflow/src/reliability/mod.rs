//! Reliability patterns for flaky external calls
//!
//! - [`RetryPolicy`]: bounded exponential backoff
//! - [`CircuitBreaker`]: failure-rate breaker with a single half-open trial
//! - [`retry_call`]: the decorator combining both around any fallible async call
//! - [`retry_call_to_completion`]: the same, never interrupting an attempt in flight

mod call;
mod circuit_breaker;
mod retry;

pub use call::{retry_call, retry_call_to_completion, CallError, Retryable};
pub use circuit_breaker::{
    BreakerMetrics, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerPermit, CircuitOpen, CircuitState,
};
pub use retry::RetryPolicy;
