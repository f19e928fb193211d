//! Rollback eligibility evaluator.
//!
//! A pure function over instance metadata: never performs I/O, never
//! panics, returns a verdict plus named sub-checks — a pure transform
//! over a snapshot, directly unit-testable without a fake service.

use chrono::{DateTime, Utc};

use crate::model::{CheckVerdict, InstanceSnapshot, InstanceState, PreCheck};

/// `true` when the evaluator is asked to judge an instance that dry-run
/// normalisation would have started first: the instance is
/// still STOPPED/SUSPENDED because dry-run never mutates.
#[derive(Debug, Clone, Copy)]
pub enum NormalisationContext {
    /// Normalisation already ran (or would run) for real.
    Live,
    /// Dry-run: normalisation was skipped, snapshot reflects pre-start state.
    DryRun,
}

/// Evaluates rollback eligibility for `snapshot` as of `now`. Checks run in
/// a fixed order, and later checks run even when earlier ones fail, so
/// callers get full diagnostic output. `eligible` is the conjunction of
/// all checks that were not `SKIPPED`.
pub fn evaluate(
    snapshot: &InstanceSnapshot,
    now: DateTime<Utc>,
    ctx: NormalisationContext,
) -> (bool, Vec<PreCheck>) {
    let mut checks = Vec::with_capacity(4);

    // 1. instance_state
    let would_skip_for_dry_run = matches!(ctx, NormalisationContext::DryRun)
        && matches!(
            snapshot.state,
            InstanceState::Stopped | InstanceState::Suspended
        );
    if would_skip_for_dry_run {
        checks.push(PreCheck {
            name: "instance_state".into(),
            verdict: CheckVerdict::Skipped,
            message: "would be started before rollback".into(),
        });
    } else if snapshot.state == InstanceState::Active {
        checks.push(PreCheck {
            name: "instance_state".into(),
            verdict: CheckVerdict::Pass,
            message: "instance is ACTIVE".into(),
        });
    } else {
        checks.push(PreCheck {
            name: "instance_state".into(),
            verdict: CheckVerdict::Fail,
            message: format!("instance is not ACTIVE (state={:?})", snapshot.state),
        });
    }

    // 2. upgrade_history
    if snapshot.last_upgrade_at.is_some() {
        checks.push(PreCheck {
            name: "upgrade_history".into(),
            verdict: CheckVerdict::Pass,
            message: "instance has a recorded upgrade".into(),
        });
    } else {
        checks.push(PreCheck {
            name: "upgrade_history".into(),
            verdict: CheckVerdict::Fail,
            message: "instance has never been upgraded".into(),
        });
    }

    // 3. previous_version
    match &snapshot.previous_version {
        Some(v) if !v.trim().is_empty() => {
            checks.push(PreCheck {
                name: "previous_version".into(),
                verdict: CheckVerdict::Pass,
                message: format!("previous version {} recorded", v),
            });
        }
        _ => {
            checks.push(PreCheck {
                name: "previous_version".into(),
                verdict: CheckVerdict::Fail,
                message: "no previous version recorded".into(),
            });
        }
    }

    // 4. rollback_window — absent is treated as open
    match snapshot.rollback_window_expires_at {
        None => checks.push(PreCheck {
            name: "rollback_window".into(),
            verdict: CheckVerdict::Pass,
            message: "no expiry recorded; window treated as open".into(),
        }),
        Some(expires) if expires > now => checks.push(PreCheck {
            name: "rollback_window".into(),
            verdict: CheckVerdict::Pass,
            message: format!("window open until {}", expires),
        }),
        Some(expires) => checks.push(PreCheck {
            name: "rollback_window".into(),
            verdict: CheckVerdict::Fail,
            message: format!("window expired at {}", expires),
        }),
    }

    let eligible = checks
        .iter()
        .all(|c| c.verdict != CheckVerdict::Fail);
    (eligible, checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HealthState;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn base_snapshot() -> InstanceSnapshot {
        InstanceSnapshot {
            name: "projects/p/locations/a/instances/i1".into(),
            short_name: "i1".into(),
            location: "a".into(),
            state: InstanceState::Active,
            health_state: HealthState::Healthy,
            current_version: "v2".into(),
            available_upgrade_version: None,
            previous_version: Some("v1".into()),
            last_upgrade_at: Some(Utc::now() - Duration::days(2)),
            rollback_window_expires_at: None,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn fully_eligible_instance_passes_all_checks() {
        let snap = base_snapshot();
        let (eligible, checks) = evaluate(&snap, Utc::now(), NormalisationContext::Live);
        assert!(eligible);
        assert!(checks.iter().all(|c| c.verdict == CheckVerdict::Pass));
        assert_eq!(checks.len(), 4);
    }

    #[test]
    fn never_upgraded_instance_is_ineligible_but_all_checks_still_run() {
        let mut snap = base_snapshot();
        snap.last_upgrade_at = None;
        snap.previous_version = None;
        let (eligible, checks) = evaluate(&snap, Utc::now(), NormalisationContext::Live);
        assert!(!eligible);
        assert_eq!(checks.len(), 4, "later checks still run for full diagnostics");
        assert_eq!(
            checks.iter().find(|c| c.name == "upgrade_history").unwrap().verdict,
            CheckVerdict::Fail
        );
        assert_eq!(
            checks.iter().find(|c| c.name == "previous_version").unwrap().verdict,
            CheckVerdict::Fail
        );
    }

    #[test]
    fn dry_run_stopped_instance_skips_instance_state_check() {
        let mut snap = base_snapshot();
        snap.state = InstanceState::Stopped;
        let (eligible, checks) = evaluate(&snap, Utc::now(), NormalisationContext::DryRun);
        let instance_check = checks.iter().find(|c| c.name == "instance_state").unwrap();
        assert_eq!(instance_check.verdict, CheckVerdict::Skipped);
        assert_eq!(instance_check.message, "would be started before rollback");
        // remaining checks still evaluated on the metadata
        assert!(eligible);
    }

    #[test]
    fn expired_rollback_window_fails_that_check_only() {
        let mut snap = base_snapshot();
        snap.rollback_window_expires_at = Some(Utc::now() - Duration::hours(1));
        let (eligible, checks) = evaluate(&snap, Utc::now(), NormalisationContext::Live);
        assert!(!eligible);
        assert_eq!(
            checks.iter().find(|c| c.name == "rollback_window").unwrap().verdict,
            CheckVerdict::Fail
        );
    }

    #[test]
    fn absent_rollback_window_is_treated_as_open() {
        let snap = base_snapshot();
        assert!(snap.rollback_window_expires_at.is_none());
        let (eligible, _) = evaluate(&snap, Utc::now(), NormalisationContext::Live);
        assert!(eligible);
    }
}
