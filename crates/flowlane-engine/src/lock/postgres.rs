use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::{InstanceLock, LockError, LockGuard};

/// `pg_try_advisory_lock`-backed instance lock.
///
/// The lock is session-scoped: it lives on one held connection for as long
/// as the guard is alive, and PostgreSQL releases it unprompted if that
/// connection is lost, which is the crash-recovery property the lease
/// exists for. `lease` is not separately enforced here — see SPEC_FULL.md §9.
pub struct PostgresAdvisoryLock {
    pool: PgPool,
    held: dashmap::DashMap<u64, PoolConnection<Postgres>>,
    next_token: AtomicU64,
}

impl PostgresAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: dashmap::DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }

    fn advisory_key(instance_id: Uuid) -> i64 {
        let bytes: [u8; 8] = instance_id.as_bytes()[..8].try_into().unwrap();
        i64::from_be_bytes(bytes)
    }
}

#[async_trait]
impl InstanceLock for PostgresAdvisoryLock {
    async fn try_acquire(
        &self,
        instance_id: Uuid,
        _lease: std::time::Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let key = Self::advisory_key(instance_id);
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if !acquired {
            return Ok(None);
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.held.insert(token, conn);
        Ok(Some(LockGuard { instance_id, token }))
    }

    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let Some((_, mut conn)) = self.held.remove(&guard.token) else {
            return Ok(());
        };
        let key = Self::advisory_key(guard.instance_id);
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_deterministic() {
        let id = Uuid::now_v7();
        assert_eq!(
            PostgresAdvisoryLock::advisory_key(id),
            PostgresAdvisoryLock::advisory_key(id)
        );
    }
}
