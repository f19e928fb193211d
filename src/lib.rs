//! Fleet lifecycle engine: orchestrates version-upgrade and rollback
//! transitions across a fleet of managed notebook compute instances,
//! under bounded concurrency with per-instance health validation,
//! optional automatic reversal on failure, and auditable reporting.
//!
//! The engine is a library core. Argument parsing,
//! configuration-file loading, and process-logging setup are external
//! collaborators; callers construct a [`model::RunConfig`], a concrete
//! [`service::InstanceService`], a [`clock::Clock`], and call [`run`].

#[macro_use]
extern crate error_chain;

pub mod clock;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod health;
pub mod model;
pub mod report;
pub mod scheduler;
pub mod service;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod tracker;

use std::sync::Arc;

use chrono::Utc;

pub use error::{Error, ErrorKind, Result, ResultExt};
pub use model::{FleetReport, RunConfig};

use clock::{CancellationToken, Clock};
use model::Statistics;
use service::InstanceService;

/// Runs one fleet operation end to end:
/// `validate(cfg) -> discover -> per-instance executor (bounded, staggered)
/// -> aggregate -> FleetReport`.
///
/// Fails only on `CONFIG_INVALID`, before any I/O is performed; every other
/// failure is captured inside a per-instance [`model::OperationResult`] and
/// this function returns `Ok`.
pub fn run(
    mut cfg: RunConfig,
    svc: Arc<dyn InstanceService>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<FleetReport> {
    cfg.validate()?;

    let started_at = clock.now();
    log::info!(
        "starting {} run for project={} locations={:?} maxParallel={} dryRun={}",
        cfg.operation,
        cfg.project,
        cfg.locations,
        cfg.max_parallel,
        cfg.dry_run
    );

    let (results, message) = scheduler::run_fleet(&cfg, svc, clock.clone(), cancel);

    let finished_at = clock.now();
    let duration_seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
    let statistics = Statistics::derive(&results);

    log::info!(
        "finished {} run in {:.1}s: total={} succeeded={} failed={} skipped={} compensated={}",
        cfg.operation,
        duration_seconds,
        statistics.total,
        statistics.succeeded,
        statistics.failed,
        statistics.skipped,
        statistics.compensated
    );

    Ok(FleetReport {
        started_at,
        finished_at,
        duration_seconds: duration_seconds.max(0.0),
        config: cfg,
        statistics,
        results,
        message,
    })
}
