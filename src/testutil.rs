//! Test doubles for `InstanceService` and `Clock`.
//!
//! `InstanceService` is a trait seam rather than an HTTP client, so no
//! wire mock is needed — a hand-written fake behind the same trait the
//! production adapter implements plays that role instead.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::clock::{CancellationToken, Clock};
use crate::error::{ErrorKind, Result};
use crate::model::{HealthState, InstanceSnapshot, InstanceState, OperationHandle};
use crate::service::{InstanceService, OperationStatusReport, UpgradeCheck};

/// A scripted outcome consumed once per matching call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ok,
    Err(ErrorKindTag),
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorKindTag {
    RateLimited,
    Transient,
    PreconditionViolated,
    NotFound,
    AuthFailed,
    Unexpected,
}

impl ErrorKindTag {
    fn into_kind(self, msg: &str) -> ErrorKind {
        match self {
            ErrorKindTag::RateLimited => ErrorKind::RateLimited(msg.into()),
            ErrorKindTag::Transient => ErrorKind::Transient(msg.into()),
            ErrorKindTag::PreconditionViolated => ErrorKind::PreconditionViolated(msg.into()),
            ErrorKindTag::NotFound => ErrorKind::NotFound(msg.into()),
            ErrorKindTag::AuthFailed => ErrorKind::AuthFailed(msg.into()),
            ErrorKindTag::Unexpected => ErrorKind::Unexpected(msg.into()),
        }
    }

    fn into_error(self, msg: &str) -> crate::error::Error {
        self.into_kind(msg).into()
    }
}

struct Inner {
    instances: HashMap<String, InstanceSnapshot>,
    upgrade_targets: HashMap<String, String>,
    /// scripted outcomes for begin_upgrade, keyed by full instance name
    begin_upgrade_script: HashMap<String, VecDeque<Scripted>>,
    /// scripted outcomes for get_operation, keyed by handle id: after the
    /// op is "begun", the Nth poll returns this outcome (done+error, or
    /// success once exhausted).
    operation_outcome: HashMap<String, OperationStatusReport>,
    /// `list(project, location)` fails with this error, once, for the
    /// named location.
    list_failure: HashMap<String, ErrorKindTag>,
    calls: Vec<String>,
}

/// Fake `InstanceService` backed by an in-memory fixture. Records every
/// call so tests can assert dry-run purity.
pub struct FakeInstanceService {
    inner: Mutex<Inner>,
}

impl FakeInstanceService {
    pub fn empty() -> Self {
        FakeInstanceService {
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                upgrade_targets: HashMap::new(),
                begin_upgrade_script: HashMap::new(),
                operation_outcome: HashMap::new(),
                list_failure: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// The shared four-instance, two-location fixture used throughout
    /// the test suite:
    /// `A/i1@ACTIVE,up=v2`, `A/i2@ACTIVE,uptodate`, `B/i3@STOPPED,up=v2`
    /// (itself rollback-eligible), `B/i4@ACTIVE,prev=v1,lastUpgrade=2d_ago`.
    pub fn shared_fixture() -> Self {
        let svc = FakeInstanceService::empty();
        let now = Utc::now();
        {
            let mut inner = svc.inner.lock().unwrap();
            inner.instances.insert(
                "projects/p/locations/A/instances/i1".into(),
                snapshot("i1", "A", InstanceState::Active, "v1", None, None, None),
            );
            inner.instances.insert(
                "projects/p/locations/A/instances/i2".into(),
                snapshot("i2", "A", InstanceState::Active, "v2", None, None, None),
            );
            inner.instances.insert(
                "projects/p/locations/B/instances/i3".into(),
                snapshot(
                    "i3",
                    "B",
                    InstanceState::Stopped,
                    "v1",
                    Some("v0"),
                    Some(now - ChronoDuration::days(5)),
                    None,
                ),
            );
            inner.instances.insert(
                "projects/p/locations/B/instances/i4".into(),
                snapshot(
                    "i4",
                    "B",
                    InstanceState::Active,
                    "v2",
                    Some("v1"),
                    Some(now - ChronoDuration::days(2)),
                    None,
                ),
            );
            inner.upgrade_targets.insert("i1".into(), "v2".into());
            inner.upgrade_targets.insert("i3".into(), "v2".into());
        }
        svc
    }

    /// Seeds a single `ACTIVE` instance with an available upgrade target,
    /// for stress/concurrency tests that don't need the full shared fixture.
    pub fn seed_upgradable(&self, short_name: &str, location: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(
            format!("projects/p/locations/{}/instances/{}", location, short_name),
            snapshot(short_name, location, InstanceState::Active, "v1", None, None, None),
        );
        inner.upgrade_targets.insert(short_name.to_string(), "v2".into());
    }

    /// Seeds a single `ACTIVE`, already-up-to-date instance (no upgrade
    /// target), for tests that only need fleet size, not dispatch.
    pub fn seed_active_up_to_date(&self, short_name: &str, location: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(
            format!("projects/p/locations/{}/instances/{}", location, short_name),
            snapshot(short_name, location, InstanceState::Active, "v1", None, None, None),
        );
    }

    /// Seeds an `ACTIVE` instance that is both upgradable (has a pending
    /// target version) and rollback-eligible (carries `previousVersion` and
    /// `lastUpgradeAt`), for tests that drive a failed upgrade through to
    /// compensation.
    pub fn seed_upgradable_and_rollback_eligible(&self, short_name: &str, location: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(
            format!("projects/p/locations/{}/instances/{}", location, short_name),
            snapshot(
                short_name,
                location,
                InstanceState::Active,
                "v1",
                Some("v0"),
                Some(Utc::now() - ChronoDuration::days(2)),
                None,
            ),
        );
        inner.upgrade_targets.insert(short_name.to_string(), "v2".into());
    }

    /// Seeds a single instance in an arbitrary state, for admission and
    /// normalisation tests that need states other than the fixture's.
    pub fn seed_with_state(&self, short_name: &str, location: &str, state: InstanceState) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(
            format!("projects/p/locations/{}/instances/{}", location, short_name),
            snapshot(short_name, location, state, "v1", None, None, None),
        );
    }

    /// Makes `list(project, location)` fail once with `kind` the next time
    /// it is called for `location`.
    pub fn fail_list(&self, location: &str, kind: ErrorKindTag) {
        let mut inner = self.inner.lock().unwrap();
        inner.list_failure.insert(location.to_string(), kind);
    }

    /// Schedules `outcome` to be returned the next time `begin_upgrade` is
    /// called for `short_name`, consumed once per call (FIFO).
    pub fn script_begin_upgrade(&self, short_name: &str, outcomes: Vec<Scripted>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .begin_upgrade_script
            .entry(short_name.to_string())
            .or_insert_with(VecDeque::new)
            .extend(outcomes);
    }

    /// Makes the operation behind `handle` resolve as done-with-error on
    /// its first poll.
    pub fn fail_operation(&self, handle: &OperationHandle, kind: ErrorKindTag, msg: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.operation_outcome.insert(
            handle.0.clone(),
            OperationStatusReport {
                done: true,
                error: Some(kind.into_kind(msg)),
            },
        );
    }

    pub fn call_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn record(&self, inner: &mut Inner, call: &str) {
        inner.calls.push(call.to_string());
    }

    fn find_by_short_name(&self, inner: &Inner, name: &str) -> Option<InstanceSnapshot> {
        inner.instances.get(name).cloned()
    }
}

#[allow(clippy::too_many_arguments)]
fn snapshot(
    short_name: &str,
    location: &str,
    state: InstanceState,
    current_version: &str,
    previous_version: Option<&str>,
    last_upgrade_at: Option<DateTime<Utc>>,
    rollback_window_expires_at: Option<DateTime<Utc>>,
) -> InstanceSnapshot {
    InstanceSnapshot {
        name: format!("projects/p/locations/{}/instances/{}", location, short_name),
        short_name: short_name.to_string(),
        location: location.to_string(),
        state,
        health_state: HealthState::Healthy,
        current_version: current_version.to_string(),
        available_upgrade_version: None,
        previous_version: previous_version.map(String::from),
        last_upgrade_at,
        rollback_window_expires_at,
        labels: BTreeMap::new(),
    }
}

impl InstanceService for FakeInstanceService {
    fn list(&self, _project: &str, location: &str) -> Result<Vec<InstanceSnapshot>> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("list:{}", location));
        if let Some(kind) = inner.list_failure.remove(location) {
            return Err(kind.into_error(&format!("scripted list failure for {}", location)));
        }
        let mut v: Vec<InstanceSnapshot> = inner
            .instances
            .values()
            .filter(|i| i.location == location)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(v)
    }

    fn get(&self, name: &str) -> Result<InstanceSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("get:{}", name));
        self.find_by_short_name(&inner, name)
            .ok_or_else(|| ErrorKind::NotFound(name.to_string()).into())
    }

    fn start(&self, name: &str) -> Result<OperationHandle> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("start:{}", name));
        let snap = inner
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(name.to_string()))?;
        if !matches!(snap.state, InstanceState::Stopped | InstanceState::Suspended) {
            return Err(ErrorKind::PreconditionViolated(format!(
                "{} is not stopped/suspended",
                name
            ))
            .into());
        }
        if let Some(i) = inner.instances.get_mut(name) {
            i.state = InstanceState::Active;
        }
        Ok(OperationHandle(format!("start:{}", name)))
    }

    fn begin_upgrade(&self, name: &str) -> Result<OperationHandle> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("begin_upgrade:{}", name));
        let short = short_name_of(name);
        if let Some(queue) = inner.begin_upgrade_script.get_mut(&short) {
            if let Some(next) = queue.pop_front() {
                match next {
                    Scripted::Ok => {}
                    Scripted::Err(k) => return Err(k.into_error(&format!("scripted failure for {}", name))),
                }
            }
        }
        let target = inner.upgrade_targets.get(&short).cloned();
        if let Some(i) = inner.instances.get_mut(name) {
            if let Some(t) = &target {
                i.current_version = t.clone();
            }
        }
        Ok(OperationHandle(format!("upgrade:{}", name)))
    }

    fn begin_rollback(&self, name: &str) -> Result<OperationHandle> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("begin_rollback:{}", name));
        if let Some(i) = inner.instances.get_mut(name) {
            if let Some(prev) = i.previous_version.clone() {
                i.current_version = prev;
            }
        }
        Ok(OperationHandle(format!("rollback:{}", name)))
    }

    fn get_operation(&self, handle: &OperationHandle) -> Result<OperationStatusReport> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("get_operation:{}", handle.0));
        if let Some(outcome) = inner.operation_outcome.remove(&handle.0) {
            return Ok(outcome);
        }
        Ok(OperationStatusReport { done: true, error: None })
    }

    fn check_upgradable(&self, name: &str) -> Result<UpgradeCheck> {
        let mut inner = self.inner.lock().unwrap();
        self.record(&mut inner, &format!("check_upgradable:{}", name));
        let short = short_name_of(name);
        let target = inner.upgrade_targets.get(&short).cloned();
        Ok(UpgradeCheck {
            upgradable: target.is_some(),
            target_version: target,
        })
    }
}

fn short_name_of(full_name: &str) -> String {
    full_name.rsplit('/').next().unwrap_or(full_name).to_string()
}

/// A `Clock` that never really sleeps (so tests run instantly) but still
/// advances a virtual "now" on every `sleep` call, so duration assertions
/// remain meaningful.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            now: Mutex::new(Utc::now()),
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        FakeClock::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, dur: Duration, _cancel: &CancellationToken) {
        let mut now = self.now.lock().unwrap();
        *now = *now + ChronoDuration::from_std(dur).unwrap_or(ChronoDuration::zero());
    }
}
