//! Long-running operation tracker.
//!
//! Polls a named operation to completion with bounded duration, jittered
//! backoff, and cancellation. All retry/backoff, including the mutation
//! path, is centralised here — no other component retries.

use std::time::Duration;

use rand::Rng;

use crate::clock::{deadline_from, remaining_until, CancellationToken, Clock};
use crate::error::{Error, ErrorKind, Result};
use crate::model::OperationHandle;
use crate::service::InstanceService;

/// Outcome of tracking one operation to completion.
#[derive(Debug)]
pub enum TrackOutcome {
    Succeeded,
    Failed(ErrorKind),
    Timeout,
    Cancelled,
}

const MAX_TRANSIENT_RETRIES: u32 = 5;

/// Blocks (via `clock.sleep`) until the operation behind `handle` resolves,
/// the wall clock exceeds `timeout`, or `cancel` fires.
///
/// Polling schedule: first poll after `poll_interval`, thereafter every
/// `poll_interval ± 20%` jitter. Transient errors back off exponentially,
/// capped at `min(5 * poll_interval, 120s)`, up to 5 consecutive retries
/// before surfacing the error.
pub fn track(
    svc: &dyn InstanceService,
    handle: &OperationHandle,
    poll_interval: Duration,
    timeout: Duration,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> TrackOutcome {
    let deadline = deadline_from(clock.now(), timeout);
    let mut transient_retries: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return TrackOutcome::Cancelled;
        }

        let wait = next_poll_wait(poll_interval, transient_retries);
        let remaining = remaining_until(deadline, clock.now());
        if remaining.is_zero() {
            return TrackOutcome::Timeout;
        }
        clock.sleep(wait.min(remaining), cancel);

        if cancel.is_cancelled() {
            return TrackOutcome::Cancelled;
        }
        if clock.now() >= deadline {
            return TrackOutcome::Timeout;
        }

        match svc.get_operation(handle) {
            Ok(report) => {
                transient_retries = 0;
                if report.done {
                    return match report.error {
                        None => TrackOutcome::Succeeded,
                        Some(k) => TrackOutcome::Failed(k),
                    };
                }
                // not done yet; loop and poll again
            }
            Err(e) => {
                if is_transient(e.kind()) && transient_retries < MAX_TRANSIENT_RETRIES {
                    transient_retries += 1;
                    log::warn!(
                        "transient error polling operation, retry {}/{}: {}",
                        transient_retries,
                        MAX_TRANSIENT_RETRIES,
                        e
                    );
                    continue;
                }
                return TrackOutcome::Failed(e.into_kind_value());
            }
        }
    }
}

/// Retries a mutation call (`start`/`beginUpgrade`/`beginRollback`) that has
/// not yet produced an [`OperationHandle`] to track. `RATE_LIMITED` and
/// `TRANSIENT` errors are retried with the same backoff schedule as
/// [`track`]; everything else (notably `PRECONDITION_VIOLATED`) surfaces
/// immediately, since retrying it would just race the same controller
/// again. Centralising this here keeps retry/backoff in one place.
pub fn retry_mutation<F>(
    mut f: F,
    poll_interval: Duration,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> Result<OperationHandle>
where
    F: FnMut() -> Result<OperationHandle>,
{
    let mut retries = 0u32;
    loop {
        match f() {
            Ok(h) => return Ok(h),
            Err(e) => {
                if is_transient(e.kind()) && retries < MAX_TRANSIENT_RETRIES {
                    retries += 1;
                    let wait = next_poll_wait(poll_interval, retries);
                    log::warn!(
                        "transient error starting mutation, retry {}/{}: {}",
                        retries,
                        MAX_TRANSIENT_RETRIES,
                        e
                    );
                    clock.sleep(wait, cancel);
                    if cancel.is_cancelled() {
                        return Err(Error::from(ErrorKind::Cancelled));
                    }
                    continue;
                }
                return Err(e);
            }
        }
    }
}

fn is_transient(kind: &ErrorKind) -> bool {
    matches!(kind, ErrorKind::Transient(_) | ErrorKind::RateLimited(_))
}

/// `poll_interval ± 20%` jitter on the happy path; on the `n`th consecutive
/// transient retry, exponential backoff `min(poll_interval * 2^n, 5 *
/// poll_interval, 120s)` instead.
fn next_poll_wait(poll_interval: Duration, transient_retries: u32) -> Duration {
    if transient_retries == 0 {
        jittered(poll_interval)
    } else {
        let base = poll_interval.saturating_mul(1 << transient_retries.min(16));
        let cap = poll_interval.saturating_mul(5).min(Duration::from_secs(120));
        base.min(cap)
    }
}

fn jittered(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

trait ErrorExt {
    fn into_kind_value(self) -> ErrorKind;
}

impl ErrorExt for crate::error::Error {
    fn into_kind_value(self) -> ErrorKind {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_secs(20);
        for _ in 0..1000 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs_f64(16.0));
            assert!(j <= Duration::from_secs_f64(24.0));
        }
    }

    #[test]
    fn backoff_is_capped_at_120s() {
        let base = Duration::from_secs(20);
        let w = next_poll_wait(base, 10);
        assert_eq!(w, Duration::from_secs(100).min(Duration::from_secs(120)));
        // base*5 = 100s < 120s cap, so 100s is the effective ceiling here
        assert!(w <= Duration::from_secs(120));
    }

    #[test]
    fn backoff_grows_then_saturates_at_five_times_base() {
        let base = Duration::from_secs(20);
        assert_eq!(next_poll_wait(base, 1), Duration::from_secs(40));
        assert_eq!(next_poll_wait(base, 2), Duration::from_secs(80));
        // 20*2^3 = 160 > 5*20 = 100, so capped at 100
        assert_eq!(next_poll_wait(base, 3), Duration::from_secs(100));
    }
}
