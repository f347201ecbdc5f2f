use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{InstanceLock, LockError, LockGuard};

/// In-process lock for tests and the in-memory store path. Holds each
/// instance's lease expiry in a `DashMap`.
#[derive(Default)]
pub struct InMemoryLock {
    held: DashMap<Uuid, (u64, Instant)>,
    next_token: std::sync::atomic::AtomicU64,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceLock for InMemoryLock {
    async fn try_acquire(
        &self,
        instance_id: Uuid,
        lease: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let now = Instant::now();
        if let Some(entry) = self.held.get(&instance_id) {
            if entry.1 > now {
                return Ok(None);
            }
        }
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.held.insert(instance_id, (token, now + lease));
        Ok(Some(LockGuard { instance_id, token }))
    }

    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        if let Some(entry) = self.held.get(&guard.instance_id) {
            if entry.0 == guard.token {
                drop(entry);
                self.held.remove(&guard.instance_id);
            }
        }
        Ok(())
    }
}
