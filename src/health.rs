//! Health verifier.
//!
//! Polls `get(name)` until the instance reaches `ACTIVE` with an acceptable
//! health signal, or until `health_check_timeout` elapses. Factored out of
//! the executor so it can be reused standalone rather than inlined at each
//! call site.

use std::time::Duration;

use crate::clock::{deadline_from, remaining_until, CancellationToken, Clock};
use crate::model::{HealthState, InstanceState};
use crate::service::InstanceService;

#[derive(Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    TimedOut,
    Cancelled,
    /// Reached a terminal, non-ACTIVE state that is not transient.
    TerminalMismatch(InstanceState),
}

/// Blocks until `name` reports `state = ACTIVE` and
/// `healthState ∈ {HEALTHY, UNKNOWN}` (UNKNOWN is accepted: some provider
/// builds never publish a health signal, and refusing it would produce
/// false negatives), or until `timeout` elapses.
pub fn verify(
    svc: &dyn InstanceService,
    name: &str,
    poll_interval: Duration,
    timeout: Duration,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> HealthOutcome {
    let deadline = deadline_from(clock.now(), timeout);
    loop {
        if cancel.is_cancelled() {
            return HealthOutcome::Cancelled;
        }
        match svc.get(name) {
            Ok(snap) => {
                if snap.state == InstanceState::Active
                    && matches!(snap.health_state, HealthState::Healthy | HealthState::Unknown)
                {
                    return HealthOutcome::Healthy;
                }
                if snap.state != InstanceState::Active && !snap.state.is_transient_ok() {
                    return HealthOutcome::TerminalMismatch(snap.state);
                }
            }
            Err(e) => {
                log::warn!("health verifier: get({}) failed: {}", name, e);
            }
        }
        let remaining = remaining_until(deadline, clock.now());
        if remaining.is_zero() {
            return HealthOutcome::TimedOut;
        }
        clock.sleep(poll_interval.min(remaining), cancel);
        if clock.now() >= deadline {
            return HealthOutcome::TimedOut;
        }
    }
}
