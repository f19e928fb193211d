//! Fleet scheduler: discovery across locations,
//! bounded-parallel dispatch with start-time stagger, result aggregation.
//!
//! A `threadpool::ThreadPool` bounds concurrency, an `mpsc` channel
//! collects one result per dispatched worker, and the scheduler never
//! touches a shared mutable accumulator while workers are in flight.

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use threadpool::ThreadPool;

use crate::clock::{CancellationToken, Clock};
use crate::executor;
use crate::model::{
    InstanceSnapshot, InstanceState, OperationResult, OperationStatus, ReportErrorKind, RunConfig,
};
use crate::service::InstanceService;

/// Runs discovery then dispatches bounded-parallel per-instance executors,
/// returning every [`OperationResult`] sorted by `(location, shortName)`,
/// plus an optional top-level message for the zero-results-matched case.
pub fn run_fleet(
    cfg: &RunConfig,
    svc: Arc<dyn InstanceService>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> (Vec<OperationResult>, Option<String>) {
    let discovery = discover(cfg, svc.as_ref());
    if let Some(msg) = discovery.empty_message {
        return (Vec::new(), Some(msg));
    }

    if let Some(location) = discovery.auth_failed_at {
        // AUTH_FAILED is fatal for the run: stop discovering further
        // locations, but still account for every instance already found.
        let msg = format!(
            "authentication failed while listing location {}; {} already-discovered instance(s) skipped",
            location,
            discovery.fleet.len()
        );
        let mut results: Vec<OperationResult> = discovery
            .fleet
            .iter()
            .map(|snap| {
                let mut res = skipped_template(snap, cfg, clock.as_ref());
                res.error_kind = Some(ReportErrorKind::AuthFailed);
                res.error_message = Some("authentication with the provider failed".into());
                res.finished_at = Some(res.started_at);
                res.duration_seconds = Some(0.0);
                res
            })
            .collect();
        results.sort_by(|a, b| {
            (a.location.as_str(), a.instance.as_str()).cmp(&(b.location.as_str(), b.instance.as_str()))
        });
        return (results, Some(msg));
    }

    let admitted = admit(discovery.fleet);

    let n_jobs = admitted.len();
    if n_jobs == 0 {
        return (Vec::new(), None);
    }

    let n_workers = cfg.max_parallel.min(n_jobs).max(1);
    let pool = ThreadPool::new(n_workers);
    log::info!(
        "dispatching {} instances across {} workers (operation={})",
        n_jobs,
        n_workers,
        cfg.operation
    );

    let stagger = Duration::from_secs_f64(cfg.stagger_delay_secs.max(0.0));
    let (tx, rx) = channel();
    let mut last_dispatch: Option<DateTime<Utc>> = None;

    for item in admitted {
        match item {
            Admitted::Ready(snapshot) => {
                if cancel.is_cancelled() {
                    let _ = tx.send(cancelled_result(&snapshot, cfg, clock.as_ref()));
                    continue;
                }
                if let Some(prev) = last_dispatch {
                    let elapsed = (clock.now() - prev).to_std().unwrap_or(Duration::ZERO);
                    if elapsed < stagger {
                        clock.sleep(stagger - elapsed, &cancel);
                    }
                }
                last_dispatch = Some(clock.now());

                let tx = tx.clone();
                let cfg = cfg.clone();
                let svc = svc.clone();
                let clock = clock.clone();
                let cancel = cancel.clone();
                pool.execute(move || {
                    log::info!(
                        "instance={} location={} phase=dispatch",
                        snapshot.short_name,
                        snapshot.location
                    );
                    let res = executor::execute(&snapshot, &cfg, svc.as_ref(), clock.as_ref(), &cancel);
                    log::info!(
                        "instance={} location={} phase=complete status={:?}",
                        snapshot.short_name,
                        snapshot.location,
                        res.status
                    );
                    let _ = tx.send(res);
                });
            }
            Admitted::Unrecognised { snapshot, raw_state } => {
                let mut res = skipped_template(&snapshot, cfg, clock.as_ref());
                res.error_kind = Some(ReportErrorKind::Ineligible);
                res.error_message = Some(format!("unrecognised instance state {:?}", raw_state));
                res.finished_at = Some(res.started_at);
                res.duration_seconds = Some(0.0);
                let _ = tx.send(res);
            }
        }
    }
    drop(tx);

    let mut results: Vec<OperationResult> = rx.into_iter().collect();
    pool.join();

    results.sort_by(|a, b| (a.location.as_str(), a.instance.as_str()).cmp(&(b.location.as_str(), b.instance.as_str())));
    (results, None)
}

enum Admitted {
    Ready(InstanceSnapshot),
    Unrecognised { snapshot: InstanceSnapshot, raw_state: InstanceState },
}

/// Admission step: instances whose state is unknown
/// to the schema are skipped with an explanatory message rather than
/// dispatched.
fn admit(fleet: Vec<InstanceSnapshot>) -> Vec<Admitted> {
    fleet
        .into_iter()
        .map(|snap| {
            if snap.state == InstanceState::Unknown {
                let raw_state = snap.state;
                Admitted::Unrecognised { snapshot: snap, raw_state }
            } else {
                Admitted::Ready(snap)
            }
        })
        .collect()
}

/// Outcome of the discovery step.
struct Discovery {
    fleet: Vec<InstanceSnapshot>,
    /// Set when a location's `list` call failed with `AUTH_FAILED`; the
    /// location at which this happened. Discovery stops at this point but
    /// `fleet` still holds everything found in earlier locations.
    auth_failed_at: Option<String>,
    /// Set only for the "zero results" terminal cases (instance filter
    /// matched nothing); when set, the run ends with an empty report.
    empty_message: Option<String>,
}

/// Discovery step: enumerate every location in
/// order, optionally filtering to a single instance by short name.
fn discover(cfg: &RunConfig, svc: &dyn InstanceService) -> Discovery {
    let mut fleet = Vec::new();
    for location in &cfg.locations {
        match svc.list(&cfg.project, location) {
            Ok(instances) => fleet.extend(instances),
            Err(e) => {
                if matches!(e.kind(), crate::error::ErrorKind::AuthFailed(_)) {
                    log::error!("authentication failed while listing {}: {}", location, e);
                    return Discovery {
                        fleet,
                        auth_failed_at: Some(location.clone()),
                        empty_message: None,
                    };
                }
                log::warn!("failed to list instances in {}: {}", location, e);
            }
        }
    }

    if let Some(filter) = &cfg.instance {
        fleet.retain(|i| &i.short_name == filter);
        if fleet.is_empty() {
            return Discovery {
                fleet,
                auth_failed_at: None,
                empty_message: Some(format!(
                    "no instance named '{}' found in any requested location",
                    filter
                )),
            };
        }
    }

    Discovery {
        fleet,
        auth_failed_at: None,
        empty_message: None,
    }
}

fn skipped_template(snapshot: &InstanceSnapshot, cfg: &RunConfig, clock: &dyn Clock) -> OperationResult {
    OperationResult {
        instance: snapshot.short_name.clone(),
        location: snapshot.location.clone(),
        operation: cfg.operation,
        status: OperationStatus::Skipped,
        target_version: None,
        started_at: clock.now(),
        finished_at: None,
        duration_seconds: None,
        error_kind: None,
        error_message: None,
        compensated: false,
        pre_checks: Vec::new(),
    }
}

fn cancelled_result(snapshot: &InstanceSnapshot, cfg: &RunConfig, clock: &dyn Clock) -> OperationResult {
    let mut res = skipped_template(snapshot, cfg, clock);
    res.status = OperationStatus::Failed;
    res.error_kind = Some(ReportErrorKind::Cancelled);
    res.error_message = Some("run cancelled before dispatch".into());
    res.finished_at = Some(res.started_at);
    res.duration_seconds = Some(0.0);
    res
}
