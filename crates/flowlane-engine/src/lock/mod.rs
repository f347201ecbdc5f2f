//! Per-instance mutual exclusion for the orchestrator.

mod memory;
mod postgres;

pub use memory::InMemoryLock;
pub use postgres::PostgresAdvisoryLock;

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock unavailable for instance {0}")]
    Unavailable(Uuid),

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// An acquired lease. Dropping it without calling [`InstanceLock::release`]
/// is safe but leaves the release to the 30s lease expiry.
pub struct LockGuard {
    pub instance_id: Uuid,
    pub token: u64,
}

/// Distributed mutual exclusion keyed by instance id.
///
/// Guarantees the orchestrator's single-writer invariant across a fleet of
/// orchestrator processes. Acquisition is non-blocking: a caller that does
/// not get the lock should treat the event as retryable, not fail fast.
#[async_trait]
pub trait InstanceLock: Send + Sync + 'static {
    /// Attempt to acquire the lock. Returns `None` if already held.
    async fn try_acquire(&self, instance_id: Uuid, lease: std::time::Duration) -> Result<Option<LockGuard>, LockError>;

    async fn release(&self, guard: LockGuard) -> Result<(), LockError>;
}

/// Default lease duration for orchestrator instance locks (SPEC_FULL §4.1, §4.5).
pub const DEFAULT_LEASE: std::time::Duration = std::time::Duration::from_secs(30);
