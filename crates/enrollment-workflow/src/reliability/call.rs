//! Retry and circuit-breaker decorator for fallible external calls

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::retry::RetryPolicy;
use crate::clock::{Clock, TimerOutcome};

/// Errors that know whether trying again can help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a guarded call did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker refused the call; no backoff follows
    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),

    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The operation failed with an error that retrying cannot fix
    #[error("{0}")]
    Rejected(E),

    /// The owning lifecycle was cancelled mid-sequence
    #[error("call cancelled")]
    Cancelled,
}

/// Run `op` under `policy`, guarded by `breaker` when one is given
///
/// `op` receives the 1-based attempt number. Retryable failures count against
/// the breaker and back off on `clock`; non-retryable failures mean the
/// downstream answered, so they return at once and count as healthy calls.
/// Cancelling `cancel` aborts both an in-flight attempt and a pending backoff.
pub async fn retry_call<T, E, F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, CallError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    run(policy, breaker, clock, cancel, true, op).await
}

/// Like [`retry_call`], but an attempt already running always completes
///
/// Cancellation is observed before each attempt and during backoff only, for
/// operations whose effect must not be torn off halfway and whose result must
/// be reported as it happened.
pub async fn retry_call_to_completion<T, E, F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, CallError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    run(policy, breaker, clock, cancel, false, op).await
}

async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    interrupt_attempts: bool,
    mut op: F,
) -> Result<T, CallError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let permit = match breaker {
            Some(breaker) => match breaker.acquire() {
                Ok(permit) => Some(permit),
                Err(open) => return Err(CallError::CircuitOpen(open.name)),
            },
            None => None,
        };

        let result = if interrupt_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                result = op(attempt) => result,
            }
        } else {
            op(attempt).await
        };

        let error = match result {
            Ok(value) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                if let Some(permit) = permit {
                    permit.success();
                }
                return Err(CallError::Rejected(error));
            }
            Err(error) => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                error
            }
        };

        if attempt >= max_attempts {
            warn!(attempts = attempt, error = %error, "retries exhausted");
            return Err(CallError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for_attempt(attempt + 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying after backoff");

        let timer = clock.after(delay);
        let timer_cancel = timer.cancellation();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                timer_cancel.cancel();
                TimerOutcome::Cancelled
            }
            outcome = timer.wait() => outcome,
        };
        if outcome == TimerOutcome::Cancelled {
            return Err(CallError::Cancelled);
        }
    }
}
