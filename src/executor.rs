//! Per-instance executor: the state machine for one instance, driven
//! start to finish by a single worker thread spawned by the fleet
//! scheduler. Owns no shared mutable state; every dependency
//! (`InstanceService`, `Clock`, `CancellationToken`) is taken by
//! reference or clone rather than reaching for shared state.

use std::time::Duration;

use crate::clock::{CancellationToken, Clock};
use crate::eligibility::{self, NormalisationContext};
use crate::error::ErrorKind;
use crate::health::{self, HealthOutcome};
use crate::model::{
    InstanceSnapshot, InstanceState, Operation, OperationResult, OperationStatus,
    ReportErrorKind, RunConfig,
};
use crate::service::InstanceService;
use crate::tracker::{self, TrackOutcome};

/// Runs the full normalise → preflight → execute → track → verify →
/// (optionally) compensate state machine for one instance, and returns
/// exactly one [`OperationResult`] — even on internal error.
pub fn execute(
    snapshot: &InstanceSnapshot,
    cfg: &RunConfig,
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> OperationResult {
    let started_at = clock.now();
    let poll_interval = Duration::from_secs(cfg.poll_interval_secs);
    let op_timeout = Duration::from_secs(cfg.operation_timeout_secs);
    let health_timeout = Duration::from_secs(cfg.health_check_timeout_secs);

    let mut result = OperationResult {
        instance: snapshot.short_name.clone(),
        location: snapshot.location.clone(),
        operation: cfg.operation,
        status: OperationStatus::Skipped,
        target_version: None,
        started_at,
        finished_at: None,
        duration_seconds: None,
        error_kind: None,
        error_message: None,
        compensated: false,
        pre_checks: Vec::new(),
    };

    if cancel.is_cancelled() {
        return fail(result, clock, ReportErrorKind::Cancelled, "cancelled before dispatch");
    }

    // --- normalise -----------------------------------------------------
    let ready_state = if cfg.dry_run {
        // Dry-run never mutates: no start() call, eligibility sees the
        // original (possibly non-ACTIVE) state.
        snapshot.state
    } else {
        match normalise(snapshot, svc, clock, health_timeout, cancel) {
            NormaliseOutcome::AlreadyActive => InstanceState::Active,
            NormaliseOutcome::Started => InstanceState::Active,
            NormaliseOutcome::Busy(state) => {
                return skip(result, clock, ReportErrorKind::Busy, &format!("instance busy (state={:?})", state));
            }
            NormaliseOutcome::Cancelled => {
                return fail(result, clock, ReportErrorKind::Cancelled, "cancelled during normalisation");
            }
            NormaliseOutcome::Failed(kind) => {
                return fail(result, clock, ReportErrorKind::from(&kind), &kind.to_string());
            }
        }
    };

    match cfg.operation {
        Operation::Upgrade => run_upgrade(
            &mut result, snapshot, cfg, svc, clock, cancel, poll_interval, op_timeout, health_timeout,
        ),
        Operation::Rollback => run_rollback(
            &mut result, snapshot, ready_state, cfg, svc, clock, cancel, poll_interval, op_timeout,
            health_timeout,
        ),
    }

    result
}

enum NormaliseOutcome {
    AlreadyActive,
    Started,
    Busy(InstanceState),
    Cancelled,
    Failed(ErrorKind),
}

fn normalise(
    snapshot: &InstanceSnapshot,
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    health_timeout: Duration,
    cancel: &CancellationToken,
) -> NormaliseOutcome {
    match snapshot.state {
        InstanceState::Active => NormaliseOutcome::AlreadyActive,
        InstanceState::Stopped | InstanceState::Suspended => {
            let poll = Duration::from_secs(20).min(health_timeout);
            match tracker::retry_mutation(|| svc.start(&snapshot.name), poll, clock, cancel) {
                Ok(handle) => {
                    match tracker::track(svc, &handle, poll, health_timeout, clock, cancel) {
                        TrackOutcome::Succeeded => NormaliseOutcome::Started,
                        TrackOutcome::Failed(k) => NormaliseOutcome::Failed(k),
                        TrackOutcome::Timeout => {
                            NormaliseOutcome::Failed(ErrorKind::Timeout("start timed out".into()))
                        }
                        TrackOutcome::Cancelled => NormaliseOutcome::Cancelled,
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::PreconditionViolated(_) => {
                        NormaliseOutcome::Busy(snapshot.state)
                    }
                    k => NormaliseOutcome::Failed(k.clone_for_report()),
                },
            }
        }
        // BUSY: any other transient state is not retried within the run.
        other => NormaliseOutcome::Busy(other),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_upgrade(
    result: &mut OperationResult,
    snapshot: &InstanceSnapshot,
    cfg: &RunConfig,
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    poll_interval: Duration,
    op_timeout: Duration,
    health_timeout: Duration,
) {
    let check = match svc.check_upgradable(&snapshot.name) {
        Ok(c) => c,
        Err(e) => {
            set_failed(result, clock, ReportErrorKind::from(e.kind()), &e.to_string());
            return;
        }
    };
    result.target_version = check.target_version.clone();

    if !check.upgradable {
        set_terminal(result, clock, OperationStatus::UpToDate);
        return;
    }
    if cfg.dry_run {
        set_terminal(result, clock, OperationStatus::DryRun);
        return;
    }

    let handle = match tracker::retry_mutation(|| svc.begin_upgrade(&snapshot.name), poll_interval, clock, cancel) {
        Ok(h) => h,
        Err(e) => {
            if let ErrorKind::PreconditionViolated(_) = e.kind() {
                set_skipped(result, clock, ReportErrorKind::Busy, "another controller raced us (precondition violated)");
            } else {
                let kind = e.kind().clone_for_report();
                maybe_compensate(result, snapshot, cfg, svc, clock, cancel, &kind, poll_interval, op_timeout, health_timeout);
            }
            return;
        }
    };
    result.status = OperationStatus::Started;

    match tracker::track(svc, &handle, poll_interval, op_timeout, clock, cancel) {
        TrackOutcome::Succeeded => verify_then_finish(result, snapshot, cfg, svc, clock, cancel, poll_interval, op_timeout, health_timeout),
        TrackOutcome::Cancelled => set_failed(result, clock, ReportErrorKind::Cancelled, "cancelled while tracking upgrade"),
        TrackOutcome::Timeout => {
            maybe_compensate(result, snapshot, cfg, svc, clock, cancel, &ErrorKind::Timeout("upgrade tracking timed out".into()), poll_interval, op_timeout, health_timeout)
        }
        TrackOutcome::Failed(k) => {
            maybe_compensate(result, snapshot, cfg, svc, clock, cancel, &k, poll_interval, op_timeout, health_timeout)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_rollback(
    result: &mut OperationResult,
    snapshot: &InstanceSnapshot,
    ready_state: InstanceState,
    cfg: &RunConfig,
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    poll_interval: Duration,
    op_timeout: Duration,
    health_timeout: Duration,
) {
    result.target_version = snapshot.previous_version.clone();

    let ctx = if cfg.dry_run {
        NormalisationContext::DryRun
    } else {
        NormalisationContext::Live
    };
    let mut evaluated = snapshot.clone();
    evaluated.state = ready_state;
    let (eligible, checks) = eligibility::evaluate(&evaluated, clock.now(), ctx);
    result.pre_checks = checks;

    if !eligible {
        set_skipped(result, clock, ReportErrorKind::Ineligible, "rollback preconditions not met");
        return;
    }
    if cfg.dry_run {
        set_terminal(result, clock, OperationStatus::DryRun);
        return;
    }

    let handle = match tracker::retry_mutation(|| svc.begin_rollback(&snapshot.name), poll_interval, clock, cancel) {
        Ok(h) => h,
        Err(e) => {
            if let ErrorKind::PreconditionViolated(_) = e.kind() {
                set_skipped(result, clock, ReportErrorKind::Busy, "another controller raced us (precondition violated)");
            } else {
                set_failed(result, clock, ReportErrorKind::from(e.kind()), &e.to_string());
            }
            return;
        }
    };
    result.status = OperationStatus::Started;

    match tracker::track(svc, &handle, poll_interval, op_timeout, clock, cancel) {
        TrackOutcome::Succeeded => {
            match health::verify(svc, &snapshot.name, poll_interval, health_timeout, clock, cancel) {
                HealthOutcome::Healthy => set_terminal(result, clock, OperationStatus::Succeeded),
                HealthOutcome::Cancelled => set_failed(result, clock, ReportErrorKind::Cancelled, "cancelled during post-rollback verification"),
                HealthOutcome::TimedOut => set_failed(result, clock, ReportErrorKind::Timeout, "post-rollback health verification timed out"),
                HealthOutcome::TerminalMismatch(s) => set_failed(result, clock, ReportErrorKind::Unexpected, &format!("instance reached unexpected state {:?} after rollback", s)),
            }
        }
        TrackOutcome::Cancelled => set_failed(result, clock, ReportErrorKind::Cancelled, "cancelled while tracking rollback"),
        TrackOutcome::Timeout => set_failed(result, clock, ReportErrorKind::Timeout, "rollback tracking timed out"),
        TrackOutcome::Failed(k) => set_failed(result, clock, ReportErrorKind::from(&k), &k.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn verify_then_finish(
    result: &mut OperationResult,
    snapshot: &InstanceSnapshot,
    cfg: &RunConfig,
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    poll_interval: Duration,
    op_timeout: Duration,
    health_timeout: Duration,
) {
    match health::verify(svc, &snapshot.name, poll_interval, health_timeout, clock, cancel) {
        HealthOutcome::Healthy => set_terminal(result, clock, OperationStatus::Succeeded),
        HealthOutcome::Cancelled => set_failed(result, clock, ReportErrorKind::Cancelled, "cancelled during post-upgrade verification"),
        HealthOutcome::TimedOut => {
            maybe_compensate(result, snapshot, cfg, svc, clock, cancel, &ErrorKind::Timeout("post-upgrade health verification timed out".into()), poll_interval, op_timeout, health_timeout)
        }
        HealthOutcome::TerminalMismatch(s) => {
            let kind = ErrorKind::Unexpected(format!("instance reached unexpected state {:?} after upgrade", s));
            maybe_compensate(result, snapshot, cfg, svc, clock, cancel, &kind, poll_interval, op_timeout, health_timeout)
        }
    }
}

/// FAILED_MID | FAILED_POST handling: if this was an upgrade
/// with `rollbackOnFailure` set and we have not been cancelled, attempt a
/// compensating rollback; otherwise the instance is terminally FAILED.
#[allow(clippy::too_many_arguments)]
fn maybe_compensate(
    result: &mut OperationResult,
    snapshot: &InstanceSnapshot,
    cfg: &RunConfig,
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    original: &ErrorKind,
    poll_interval: Duration,
    op_timeout: Duration,
    health_timeout: Duration,
) {
    let original_msg = original.to_string();
    let original_kind = ReportErrorKind::from(original);

    if cfg.operation != Operation::Upgrade || !cfg.rollback_on_failure || cancel.is_cancelled() {
        set_failed(result, clock, original_kind, &original_msg);
        return;
    }

    let mut evaluated = snapshot.clone();
    evaluated.state = InstanceState::Active; // upgrade attempt implies the instance was active
    let (eligible, checks) = eligibility::evaluate(&evaluated, clock.now(), NormalisationContext::Live);
    result.pre_checks = checks;

    if !eligible {
        set_failed(result, clock, original_kind, &original_msg);
        return;
    }

    let handle = match tracker::retry_mutation(|| svc.begin_rollback(&snapshot.name), poll_interval, clock, cancel) {
        Ok(h) => h,
        Err(e) => {
            set_failed(
                result,
                clock,
                original_kind,
                &format!("{}; compensation_error: failed to begin rollback: {}", original_msg, e),
            );
            return;
        }
    };

    match tracker::track(svc, &handle, poll_interval, op_timeout, clock, cancel) {
        TrackOutcome::Succeeded => {
            match health::verify(svc, &snapshot.name, poll_interval, health_timeout, clock, cancel) {
                HealthOutcome::Healthy => {
                    result.compensated = true;
                    set_terminal(result, clock, OperationStatus::Compensated);
                }
                other => set_failed(
                    result,
                    clock,
                    original_kind,
                    &format!("{}; compensation_error: post-rollback verification failed: {:?}", original_msg, other),
                ),
            }
        }
        other => set_failed(
            result,
            clock,
            original_kind,
            &format!("{}; compensation_error: rollback tracking failed: {:?}", original_msg, other),
        ),
    }
}

fn set_terminal(result: &mut OperationResult, clock: &dyn Clock, status: OperationStatus) {
    result.status = status;
    result.finish(clock.now());
}

fn set_failed(result: &mut OperationResult, clock: &dyn Clock, kind: ReportErrorKind, msg: &str) {
    result.status = OperationStatus::Failed;
    result.error_kind = Some(kind);
    result.error_message = Some(msg.to_string());
    result.compensated = false;
    result.finish(clock.now());
}

fn set_skipped(result: &mut OperationResult, clock: &dyn Clock, kind: ReportErrorKind, msg: &str) {
    result.status = OperationStatus::Skipped;
    result.error_kind = Some(kind);
    result.error_message = Some(msg.to_string());
    result.finish(clock.now());
}

fn skip(mut result: OperationResult, clock: &dyn Clock, kind: ReportErrorKind, msg: &str) -> OperationResult {
    set_skipped(&mut result, clock, kind, msg);
    result
}

fn fail(mut result: OperationResult, clock: &dyn Clock, kind: ReportErrorKind, msg: &str) -> OperationResult {
    set_failed(&mut result, clock, kind, msg);
    result
}

trait ErrorKindExt {
    fn clone_for_report(&self) -> ErrorKind;
}

impl ErrorKindExt for ErrorKind {
    fn clone_for_report(&self) -> ErrorKind {
        match self {
            ErrorKind::ConfigInvalid(m) => ErrorKind::ConfigInvalid(m.clone()),
            ErrorKind::AuthFailed(m) => ErrorKind::AuthFailed(m.clone()),
            ErrorKind::NotFound(m) => ErrorKind::NotFound(m.clone()),
            ErrorKind::PreconditionViolated(m) => ErrorKind::PreconditionViolated(m.clone()),
            ErrorKind::RateLimited(m) => ErrorKind::RateLimited(m.clone()),
            ErrorKind::Transient(m) => ErrorKind::Transient(m.clone()),
            ErrorKind::Timeout(m) => ErrorKind::Timeout(m.clone()),
            ErrorKind::Cancelled => ErrorKind::Cancelled,
            ErrorKind::Unexpected(m) => ErrorKind::Unexpected(m.clone()),
            other => ErrorKind::Unexpected(other.to_string()),
        }
    }
}
