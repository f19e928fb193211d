//! Time and cancellation primitives.
//!
//! `Clock` is the one seam the engine uses for `now()`/`sleep()`, so tests
//! can substitute a fake that advances instantly instead of sleeping in
//! wall time. There is no async runtime in scope here, so cancellation is
//! a plain `Arc<AtomicBool>` flag checked at each poll tick — the
//! synchronous-thread equivalent of a `tokio::sync::oneshot` stop-channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Cooperative cancellation signal shared by every worker in a run.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Abstraction over wall-clock time, so the engine's poll loops are
/// deterministically testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for `dur`, returning early (without error) if `cancel` fires
    /// mid-sleep. Implementations should check `cancel` in small
    /// increments rather than sleeping the whole duration uninterruptibly.
    fn sleep(&self, dur: Duration, cancel: &CancellationToken);
}

/// Real wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, dur: Duration, cancel: &CancellationToken) {
        const SLICE: Duration = Duration::from_millis(100);
        let mut remaining = dur;
        while remaining > Duration::from_millis(0) {
            if cancel.is_cancelled() {
                return;
            }
            let step = if remaining < SLICE { remaining } else { SLICE };
            thread::sleep(step);
            remaining -= step;
        }
    }
}

/// Computes a deadline `timeout` in the future of `now`, measured through
/// the same `Clock` seam used everywhere else — callers must never pin a
/// deadline to `std::time::Instant::now()` directly, since that would make
/// a `FakeClock`-driven test's virtual-time `sleep` unable to ever satisfy
/// the deadline (it advances the fake clock, not the real one).
pub fn deadline_from(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// Time remaining until `deadline`, clamped to zero once it has passed.
pub fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}
