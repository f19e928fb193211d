//! The `InstanceService` capability surface.
//!
//! A thin trait over the cloud provider: no policy, no retry, no session
//! state — every method must be safe to call concurrently from many
//! workers. Concrete adapters (wire encoding, auth, path construction) are
//! external collaborators; this crate only defines the seam and a fake
//! double for tests (`testutil::FakeInstanceService`).

use crate::error::Result;
use crate::model::{InstanceSnapshot, OperationHandle};

/// Outcome of polling a long-running operation.
#[derive(Debug, Clone)]
pub struct OperationStatusReport {
    pub done: bool,
    pub error: Option<crate::error::ErrorKind>,
}

/// Result of a read-only upgrade-availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeCheck {
    pub upgradable: bool,
    pub target_version: Option<String>,
}

/// Minimal capability set the engine needs from the cloud provider.
///
/// Implementations must be `Send + Sync`: the fleet scheduler shares one
/// instance read-only across every worker thread.
pub trait InstanceService: Send + Sync {
    /// Lists instances in `location`, in stable order by resource name.
    fn list(&self, project: &str, location: &str) -> Result<Vec<InstanceSnapshot>>;

    /// Re-reads a single instance by fully qualified name.
    fn get(&self, name: &str) -> Result<InstanceSnapshot>;

    /// Starts a stopped/suspended instance. Legal only when
    /// `state ∈ {STOPPED, SUSPENDED}`; otherwise raises
    /// `PRECONDITION_VIOLATED`.
    fn start(&self, name: &str) -> Result<OperationHandle>;

    /// Begins an upgrade. Legal only when an upgrade is available and
    /// `state = ACTIVE`.
    fn begin_upgrade(&self, name: &str) -> Result<OperationHandle>;

    /// Begins a rollback. Legal only when rollback is available and
    /// `state = ACTIVE`.
    fn begin_rollback(&self, name: &str) -> Result<OperationHandle>;

    /// Polls a long-running operation. Idempotent.
    fn get_operation(&self, handle: &OperationHandle) -> Result<OperationStatusReport>;

    /// Read-only check of whether an upgrade is currently available.
    fn check_upgradable(&self, name: &str) -> Result<UpgradeCheck>;
}
