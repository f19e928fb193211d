//! End-to-end scenario tests against the fake `InstanceService`/`Clock`
//! doubles, exercising [`fleet_lifecycle_engine::run`] as a whole rather
//! than unit-testing individual modules — split into a `tests/`
//! integration suite because the scenarios span the whole public `run`
//! entry point rather than a single module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fleet_lifecycle_engine::clock::{CancellationToken, SystemClock};
use fleet_lifecycle_engine::model::{InstanceState, Operation, OperationStatus, ReportErrorKind, RunConfig};
use fleet_lifecycle_engine::testutil::{ErrorKindTag, FakeClock, FakeInstanceService, Scripted};

fn base_config(op: Operation) -> RunConfig {
    let mut cfg = RunConfig {
        operation: op,
        project: "p".into(),
        locations: vec!["A".into(), "B".into()],
        instance: None,
        dry_run: false,
        max_parallel: 2,
        operation_timeout_secs: 120,
        poll_interval_secs: 5,
        health_check_timeout_secs: 60,
        stagger_delay_secs: 0.0,
        rollback_on_failure: false,
    };
    cfg.validate().unwrap();
    cfg
}

#[test]
fn upgrade_with_rollback_on_failure_compensates_a_failed_instance() {
    let fake = FakeInstanceService::empty();
    fake.seed_upgradable_and_rollback_eligible("i1", "A");
    fake.seed_active_up_to_date("i2", "A");
    let handle = fleet_lifecycle_engine::model::OperationHandle("upgrade:projects/p/locations/A/instances/i1".into());
    fake.fail_operation(&handle, ErrorKindTag::Unexpected, "injected upgrade failure");

    let svc = Arc::new(fake);
    let clock = Arc::new(FakeClock::new());
    let mut cfg = base_config(Operation::Upgrade);
    cfg.locations = vec!["A".into()];
    cfg.rollback_on_failure = true;

    let report = fleet_lifecycle_engine::run(cfg, svc, clock, CancellationToken::new()).unwrap();

    let i1 = report.results.iter().find(|r| r.instance == "i1").unwrap();
    assert_eq!(i1.status, OperationStatus::Compensated);
    assert!(i1.compensated);

    let i2 = report.results.iter().find(|r| r.instance == "i2").unwrap();
    assert_eq!(i2.status, OperationStatus::UpToDate);

    assert_eq!(report.statistics.compensated, 1);
}

#[test]
fn rate_limited_upgrade_retries_then_succeeds() {
    let fake = FakeInstanceService::shared_fixture();
    fake.script_begin_upgrade(
        "i1",
        vec![
            Scripted::Err(ErrorKindTag::RateLimited),
            Scripted::Err(ErrorKindTag::RateLimited),
            Scripted::Err(ErrorKindTag::RateLimited),
            Scripted::Err(ErrorKindTag::RateLimited),
        ],
    );

    let svc = Arc::new(fake);
    let clock = Arc::new(FakeClock::new());
    let cfg = base_config(Operation::Upgrade);

    let report = fleet_lifecycle_engine::run(cfg, svc.clone(), clock, CancellationToken::new()).unwrap();

    let i1 = report.results.iter().find(|r| r.instance == "i1").unwrap();
    assert_eq!(i1.status, OperationStatus::Succeeded);

    let calls = svc.call_log();
    let begin_upgrade_calls = calls
        .iter()
        .filter(|c| c.starts_with("begin_upgrade:") && c.contains("i1"))
        .count();
    assert_eq!(begin_upgrade_calls, 5, "4 scripted failures + 1 final success");
}

#[test]
fn cancellation_before_any_operation_completes_fails_everything_as_cancelled() {
    let svc = Arc::new(FakeInstanceService::shared_fixture());
    let clock = Arc::new(FakeClock::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let cfg = base_config(Operation::Upgrade);
    let report = fleet_lifecycle_engine::run(cfg, svc, clock, cancel).unwrap();

    assert_eq!(report.results.len(), 4);
    assert!(report
        .results
        .iter()
        .all(|r| r.status == OperationStatus::Failed
            && r.error_kind == Some(ReportErrorKind::Cancelled)));
}

#[test]
fn max_parallel_bounds_in_flight_workers() {
    let fake = FakeInstanceService::empty();
    for i in 0..20u32 {
        let loc = if i % 2 == 0 { "A" } else { "B" };
        fake.seed_upgradable(&format!("n{}", i), loc);
    }

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let fake = Arc::new(InstrumentedService {
        inner: fake,
        in_flight: in_flight.clone(),
        max_observed: max_observed.clone(),
    });

    let clock = Arc::new(FakeClock::new());
    let mut cfg = base_config(Operation::Upgrade);
    cfg.locations = vec!["A".into(), "B".into()];
    cfg.max_parallel = 3;
    cfg.stagger_delay_secs = 0.0;

    let report = fleet_lifecycle_engine::run(cfg, fake, clock, CancellationToken::new()).unwrap();
    assert_eq!(report.results.len(), 20);
    assert!(max_observed.load(Ordering::SeqCst) <= 3);
}

#[test]
fn stagger_delay_enforces_minimum_spacing_between_dispatches() {
    let fake = FakeInstanceService::empty();
    for i in 0..6u32 {
        fake.seed_upgradable(&format!("n{}", i), "A");
    }
    let timestamps = Arc::new(Mutex::new(Vec::new()));
    let fake = Arc::new(TimestampingService {
        inner: fake,
        timestamps: timestamps.clone(),
    });

    let clock = Arc::new(SystemClock);
    let mut cfg = base_config(Operation::Upgrade);
    cfg.locations = vec!["A".into()];
    cfg.max_parallel = 6;
    cfg.stagger_delay_secs = 0.05;

    let report = fleet_lifecycle_engine::run(cfg, fake, clock, CancellationToken::new()).unwrap();
    assert_eq!(report.results.len(), 6);

    let ts = timestamps.lock().unwrap();
    let mut sorted = ts.clone();
    sorted.sort();
    for w in sorted.windows(2) {
        let gap = w[1].duration_since(w[0]);
        assert!(gap >= Duration::from_millis(45), "gap was {:?}", gap);
    }
}

#[test]
fn instance_in_unrecognised_state_is_skipped_ineligible_at_admission() {
    let fake = FakeInstanceService::empty();
    fake.seed_with_state("weird", "A", InstanceState::Unknown);
    fake.seed_active_up_to_date("i2", "A");

    let svc = Arc::new(fake);
    let clock = Arc::new(FakeClock::new());
    let mut cfg = base_config(Operation::Upgrade);
    cfg.locations = vec!["A".into()];

    let report = fleet_lifecycle_engine::run(cfg, svc, clock, CancellationToken::new()).unwrap();

    let weird = report.results.iter().find(|r| r.instance == "weird").unwrap();
    assert_eq!(weird.status, OperationStatus::Skipped);
    assert_eq!(weird.error_kind, Some(ReportErrorKind::Ineligible));
    assert!(weird
        .error_message
        .as_deref()
        .unwrap()
        .contains("unrecognised instance state"));
}

#[test]
fn auth_failure_during_discovery_skips_already_discovered_instances() {
    let fake = FakeInstanceService::empty();
    fake.seed_active_up_to_date("i1", "A");
    fake.fail_list("B", ErrorKindTag::AuthFailed);

    let svc = Arc::new(fake);
    let clock = Arc::new(FakeClock::new());
    let mut cfg = base_config(Operation::Upgrade);
    cfg.locations = vec!["A".into(), "B".into()];

    let report = fleet_lifecycle_engine::run(cfg, svc, clock, CancellationToken::new()).unwrap();

    assert_eq!(report.results.len(), 1);
    let i1 = &report.results[0];
    assert_eq!(i1.instance, "i1");
    assert_eq!(i1.status, OperationStatus::Skipped);
    assert_eq!(i1.error_kind, Some(ReportErrorKind::AuthFailed));
    assert!(report.message.is_some());
}

/// Wraps a `FakeInstanceService` to track concurrent `get`/`check_upgradable`
/// calls, which only happen while a worker is actively executing.
struct InstrumentedService {
    inner: FakeInstanceService,
    in_flight: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

impl fleet_lifecycle_engine::service::InstanceService for InstrumentedService {
    fn list(&self, project: &str, location: &str) -> fleet_lifecycle_engine::Result<Vec<fleet_lifecycle_engine::model::InstanceSnapshot>> {
        self.inner.list(project, location)
    }
    fn get(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::InstanceSnapshot> {
        self.inner.get(name)
    }
    fn start(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::OperationHandle> {
        self.inner.start(name)
    }
    fn begin_upgrade(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::OperationHandle> {
        let cur = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(cur, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        let r = self.inner.begin_upgrade(name);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        r
    }
    fn begin_rollback(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::OperationHandle> {
        self.inner.begin_rollback(name)
    }
    fn get_operation(&self, handle: &fleet_lifecycle_engine::model::OperationHandle) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::service::OperationStatusReport> {
        self.inner.get_operation(handle)
    }
    fn check_upgradable(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::service::UpgradeCheck> {
        self.inner.check_upgradable(name)
    }
}

struct TimestampingService {
    inner: FakeInstanceService,
    timestamps: Arc<Mutex<Vec<Instant>>>,
}

impl fleet_lifecycle_engine::service::InstanceService for TimestampingService {
    fn list(&self, project: &str, location: &str) -> fleet_lifecycle_engine::Result<Vec<fleet_lifecycle_engine::model::InstanceSnapshot>> {
        self.inner.list(project, location)
    }
    fn get(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::InstanceSnapshot> {
        self.inner.get(name)
    }
    fn start(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::OperationHandle> {
        self.inner.start(name)
    }
    fn begin_upgrade(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::OperationHandle> {
        self.timestamps.lock().unwrap().push(Instant::now());
        self.inner.begin_upgrade(name)
    }
    fn begin_rollback(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::model::OperationHandle> {
        self.inner.begin_rollback(name)
    }
    fn get_operation(&self, handle: &fleet_lifecycle_engine::model::OperationHandle) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::service::OperationStatusReport> {
        self.inner.get_operation(handle)
    }
    fn check_upgradable(&self, name: &str) -> fleet_lifecycle_engine::Result<fleet_lifecycle_engine::service::UpgradeCheck> {
        self.inner.check_upgradable(name)
    }
}
