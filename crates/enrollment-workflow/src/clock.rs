//! Time source and cancellable deferred signals
//!
//! Everything in the engine that reads the time or waits goes through [`Clock`]:
//! deadline checks, auto-transition delays, retry backoff and breaker reset timers.
//! Production code uses [`SystemClock`]; tests drive a [`ManualClock`] by hand.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Source of wall-clock time and deferred signals
pub trait Clock: Send + Sync + 'static {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// A signal that fires once `delay` has elapsed, unless cancelled first
    fn after(&self, delay: Duration) -> Timer;
}

/// Result of waiting on a [`Timer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Fired,
    Cancelled,
}

/// A cancellable deferred signal returned by [`Clock::after`]
#[derive(Debug)]
pub struct Timer {
    fired: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

impl Timer {
    fn pair() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                fired: rx,
                cancel: CancellationToken::new(),
            },
            tx,
        )
    }

    /// Token that cancels this timer; safe to clone and hold elsewhere
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the timer; a pending `wait` resolves to `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the timer to fire or be cancelled
    pub async fn wait(self) -> TimerOutcome {
        let Timer { fired, cancel } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => TimerOutcome::Cancelled,
            result = fired => match result {
                Ok(()) => TimerOutcome::Fired,
                // Clock dropped the sender without firing
                Err(_) => TimerOutcome::Cancelled,
            },
        }
    }
}

/// Convert a std duration into a chrono duration, saturating on overflow
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Time elapsed between `since` and `now`, zero if `since` lies in the future
pub(crate) fn elapsed_between(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Wall clock backed by `chrono::Utc` and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, delay: Duration) -> Timer {
        let (timer, tx) = Timer::pair();
        let cancel = timer.cancellation();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(());
                }
                _ = cancel.cancelled() => {}
            }
        });

        timer
    }
}

struct PendingTimer {
    due: DateTime<Utc>,
    tx: oneshot::Sender<()>,
    cancel: CancellationToken,
}

struct ManualState {
    now: DateTime<Utc>,
    pending: Vec<PendingTimer>,
}

/// Hand-driven clock for deterministic tests
///
/// Time only moves on [`ManualClock::advance`]; timers whose due time has been
/// reached fire during that call. A zero delay fires immediately.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                pending: Vec::new(),
            }),
        }
    }

    /// Move time forward and fire every timer that became due
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += chrono_duration(by);
            let now = state.now;
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|t| t.due <= now);
            state.pending = waiting;
            due
        };

        for timer in due {
            if !timer.cancel.is_cancelled() {
                let _ = timer.tx.send(());
            }
        }
    }

    /// Number of timers still waiting to fire
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|t| !t.cancel.is_cancelled())
            .count()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn after(&self, delay: Duration) -> Timer {
        let (timer, tx) = Timer::pair();
        if delay.is_zero() {
            let _ = tx.send(());
            return timer;
        }

        let mut state = self.state.lock();
        let due = state.now + chrono_duration(delay);
        state.pending.push(PendingTimer {
            due,
            tx,
            cancel: timer.cancellation(),
        });
        timer
    }
}
