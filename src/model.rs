//! Value types for run configuration, instance snapshots, per-instance
//! results and the fleet report.
//!
//! Kept as plain public-field structs with a handful of pure constructors:
//! no builder pattern, no hidden invariants beyond the single
//! `RunConfig::validate` gate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};

/// Which lifecycle transition a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Upgrade,
    Rollback,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Operation::Upgrade => write!(f, "UPGRADE"),
            Operation::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

/// Observed lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Active,
    Stopped,
    Suspended,
    Starting,
    Stopping,
    Provisioning,
    Upgrading,
    Initializing,
    Suspending,
    Unknown,
}

impl InstanceState {
    /// Parses the provider's wire vocabulary, folding anything unrecognised
    /// into `Unknown` rather than failing.
    pub fn parse(raw: &str) -> InstanceState {
        match raw {
            "ACTIVE" => InstanceState::Active,
            "STOPPED" => InstanceState::Stopped,
            "SUSPENDED" => InstanceState::Suspended,
            "STARTING" => InstanceState::Starting,
            "STOPPING" => InstanceState::Stopping,
            "PROVISIONING" => InstanceState::Provisioning,
            "UPGRADING" => InstanceState::Upgrading,
            "INITIALIZING" => InstanceState::Initializing,
            "SUSPENDING" => InstanceState::Suspending,
            _ => InstanceState::Unknown,
        }
    }

    /// States the health verifier tolerates as transient.
    pub fn is_transient_ok(self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning | InstanceState::Starting | InstanceState::Initializing
        )
    }
}

/// Observed health signal of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Terminal or in-flight outcome recorded against one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    UpToDate,
    DryRun,
    Started,
    Succeeded,
    Failed,
    Skipped,
    Compensated,
}

/// The closed error vocabulary an `OperationResult` may carry,
/// decoupled from [`crate::error::ErrorKind`] so it stays plain-data and
/// serde-serialisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportErrorKind {
    ConfigInvalid,
    AuthFailed,
    NotFound,
    PreconditionViolated,
    RateLimited,
    Transient,
    Timeout,
    Cancelled,
    Busy,
    Ineligible,
    Unexpected,
}

impl<'a> From<&'a ErrorKind> for ReportErrorKind {
    fn from(k: &'a ErrorKind) -> ReportErrorKind {
        match k {
            ErrorKind::ConfigInvalid(_) => ReportErrorKind::ConfigInvalid,
            ErrorKind::AuthFailed(_) => ReportErrorKind::AuthFailed,
            ErrorKind::NotFound(_) => ReportErrorKind::NotFound,
            ErrorKind::PreconditionViolated(_) => ReportErrorKind::PreconditionViolated,
            ErrorKind::RateLimited(_) => ReportErrorKind::RateLimited,
            ErrorKind::Transient(_) => ReportErrorKind::Transient,
            ErrorKind::Timeout(_) => ReportErrorKind::Timeout,
            ErrorKind::Cancelled => ReportErrorKind::Cancelled,
            _ => ReportErrorKind::Unexpected,
        }
    }
}

/// Immutable observation of one instance taken once at discovery time
///. Re-reads during polling produce separate snapshots that
/// are never substituted back into this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub name: String,
    pub short_name: String,
    pub location: String,
    pub state: InstanceState,
    pub health_state: HealthState,
    pub current_version: String,
    pub available_upgrade_version: Option<String>,
    pub previous_version: Option<String>,
    pub last_upgrade_at: Option<DateTime<Utc>>,
    pub rollback_window_expires_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

/// Opaque identifier for an in-flight asynchronous provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

/// Verdict of a single named rollback pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckVerdict {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCheck {
    pub name: String,
    pub verdict: CheckVerdict,
    pub message: String,
}

/// One outcome per attempted instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub instance: String,
    pub location: String,
    pub operation: Operation,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ReportErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub compensated: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_checks: Vec<PreCheck>,
}

impl OperationResult {
    /// Stamps `finished_at`/`duration_seconds` from `started_at` and `now`.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        let dur = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.duration_seconds = Some(dur.max(0.0));
    }
}

/// Run-scoped configuration. Public fields, validated once via
/// [`RunConfig::validate`] before any I/O is performed — plain fields plus
/// a validation call, not a builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub operation: Operation,
    pub project: String,
    pub locations: Vec<String>,
    pub instance: Option<String>,
    pub dry_run: bool,
    pub max_parallel: usize,
    #[serde(rename = "operationTimeout")]
    pub operation_timeout_secs: u64,
    #[serde(rename = "pollInterval")]
    pub poll_interval_secs: u64,
    #[serde(rename = "healthCheckTimeout")]
    pub health_check_timeout_secs: u64,
    #[serde(rename = "staggerDelay")]
    pub stagger_delay_secs: f64,
    pub rollback_on_failure: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            operation: Operation::Upgrade,
            project: String::new(),
            locations: Vec::new(),
            instance: None,
            dry_run: false,
            max_parallel: 1,
            operation_timeout_secs: 7200,
            poll_interval_secs: 20,
            health_check_timeout_secs: 600,
            stagger_delay_secs: 3.0,
            rollback_on_failure: false,
        }
    }
}

impl RunConfig {
    /// Validates the run configuration invariants and deduplicates
    /// `locations` stably as a side effect, matching the "duplicates
    /// removed stably" requirement.
    pub fn validate(&mut self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(ErrorKind::ConfigInvalid("project must not be empty".into()).into());
        }
        if self.locations.is_empty() {
            return Err(ErrorKind::ConfigInvalid("locations must not be empty".into()).into());
        }
        let mut seen = std::collections::HashSet::new();
        self.locations.retain(|loc| seen.insert(loc.clone()));

        if self.max_parallel < 1 || self.max_parallel > 100 {
            return Err(ErrorKind::ConfigInvalid(
                "maxParallel must be in [1, 100]".into(),
            )
            .into());
        }
        if self.poll_interval_secs < 5 {
            return Err(ErrorKind::ConfigInvalid("pollInterval must be >= 5s".into()).into());
        }
        if self.poll_interval_secs > self.operation_timeout_secs {
            return Err(ErrorKind::ConfigInvalid(
                "pollInterval must be <= operationTimeout".into(),
            )
            .into());
        }
        if self.health_check_timeout_secs > self.operation_timeout_secs {
            return Err(ErrorKind::ConfigInvalid(
                "healthCheckTimeout must be <= operationTimeout".into(),
            )
            .into());
        }
        if self.stagger_delay_secs < 0.0 {
            return Err(ErrorKind::ConfigInvalid("staggerDelay must be >= 0".into()).into());
        }
        Ok(())
    }
}

/// Aggregate counters derived once at report time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total: usize,
    pub eligible: usize,
    pub up_to_date: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub compensated: usize,
}

impl Statistics {
    /// Derives counters from a finished results set. Never mutated
    /// incrementally under contention — always computed fresh.
    pub fn derive(results: &[OperationResult]) -> Statistics {
        let mut s = Statistics {
            total: results.len(),
            ..Default::default()
        };
        for r in results {
            match r.status {
                OperationStatus::UpToDate => s.up_to_date += 1,
                OperationStatus::DryRun => s.started += 1,
                OperationStatus::Started => s.started += 1,
                OperationStatus::Succeeded => {
                    s.started += 1;
                    s.succeeded += 1;
                }
                OperationStatus::Failed => {
                    s.started += 1;
                    s.failed += 1;
                }
                OperationStatus::Skipped => s.skipped += 1,
                OperationStatus::Compensated => {
                    s.started += 1;
                    s.compensated += 1;
                }
            }
            if !r.pre_checks.is_empty() {
                let all_decided = r
                    .pre_checks
                    .iter()
                    .all(|c| c.verdict != CheckVerdict::Fail);
                if all_decided {
                    s.eligible += 1;
                }
            }
        }
        s
    }
}

/// One report per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub config: RunConfig,
    pub statistics: Statistics,
    pub results: Vec<OperationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
