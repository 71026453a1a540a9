use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use tokio::time::Instant;
use tollgate_db::{DbError, LeaseMetrics, LeaseRepository};
use tracing::{debug, warn};

use super::{CoordinationLock, DEFAULT_POLL_INTERVAL, LockKey, deadline_after};
use crate::context::TenantId;
use crate::error::CoreResult;

/// How long a lease row stays marked held if the holder never releases.
const BOOKKEEPING_TTL_MINUTES: i64 = 5;

/// A pooled connection that may hold an advisory lock.
///
/// Only [`ParkedSession::unpark`] returns the connection to the pool. Any
/// other drop detaches and closes it, so the session ends and Postgres drops
/// whatever advisory locks it held.
struct ParkedSession {
    conn: Option<PoolConnection<Postgres>>,
}

impl ParkedSession {
    fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn: Some(conn) }
    }

    async fn query_flag(&mut self, sql: &'static str, lock_id: i64) -> Result<bool, sqlx::Error> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(sqlx::Error::PoolClosed);
        };
        sqlx::query_scalar::<_, bool>(sql)
            .bind(lock_id)
            .fetch_one(&mut **conn)
            .await
    }

    /// Return the connection to the pool. Only valid once it holds no lock.
    fn unpark(mut self) {
        drop(self.conn.take());
    }
}

impl Drop for ParkedSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Lock backed by `pg_try_advisory_lock`.
///
/// The lock lives on a pooled connection that is parked here until release.
/// If the process dies the session ends and Postgres drops the lock with it.
/// A connection whose unlock fails, or that is dropped while parked, is closed
/// rather than returned to the pool. Advisory locks are re-entrant per
/// session, so a pooled connection still holding one would let the next
/// caller on it acquire a lock that is already held.
/// Acquisitions are also recorded in a lease repository, when one is given,
/// so contention metrics work the same as with [`super::LeaseLock`].
pub struct PgAdvisoryLock {
    pool: PgPool,
    held: Mutex<HashMap<(i64, String), ParkedSession>>,
    leases: Option<Arc<dyn LeaseRepository>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for PgAdvisoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAdvisoryLock")
            .field("held", &self.held.lock().len())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
            leases: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_lease_metrics(mut self, leases: Arc<dyn LeaseRepository>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn record_acquired(&self, key: &LockKey, holder: &str) {
        let Some(leases) = &self.leases else {
            return;
        };
        let now = Utc::now();
        let expires_at = now + chrono::Duration::minutes(BOOKKEEPING_TTL_MINUTES);
        if let Err(e) = leases
            .record_lease_acquired(key.scope(), key.advisory_id(), holder, now, expires_at)
            .await
        {
            warn!(lock = %key, error = %e, "Failed to record advisory lock acquisition");
        }
    }
}

#[async_trait]
impl CoordinationLock for PgAdvisoryLock {
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &str,
        timeout: Duration,
    ) -> CoreResult<bool> {
        let lock_id = key.advisory_id();
        let deadline = deadline_after(timeout);

        loop {
            let conn = self.pool.acquire().await.map_err(DbError::from)?;
            // Parked before the query: if this future is dropped mid-flight
            // the session is closed instead of pooled with the lock.
            let mut session = ParkedSession::new(conn);
            let acquired = session
                .query_flag("SELECT pg_try_advisory_lock($1)", lock_id)
                .await
                .map_err(DbError::from)?;

            if acquired {
                let previous = self
                    .held
                    .lock()
                    .insert((lock_id, holder.to_string()), session);
                if previous.is_some() {
                    warn!(lock = %key, holder, "Holder acquired the same lock twice; closed the older session");
                }
                debug!(lock = %key, lock_id, holder, "Advisory lock acquired");
                self.record_acquired(key, holder).await;
                return Ok(true);
            }
            session.unpark();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn release(&self, key: &LockKey, holder: &str) -> CoreResult<bool> {
        let lock_id = key.advisory_id();
        let session = self.held.lock().remove(&(lock_id, holder.to_string()));
        let Some(mut session) = session else {
            return Ok(false);
        };

        let unlocked = session
            .query_flag("SELECT pg_advisory_unlock($1)", lock_id)
            .await;
        match &unlocked {
            Ok(_) => session.unpark(),
            Err(e) => {
                warn!(lock = %key, holder, error = %e, "Advisory unlock failed, closing the session");
                drop(session);
            }
        }

        if let Some(leases) = &self.leases {
            if let Err(e) = leases.release_lease(key.scope(), holder, Utc::now()).await {
                warn!(lock = %key, error = %e, "Failed to clear advisory lock lease row");
            }
        }
        Ok(unlocked.map_err(DbError::from)?)
    }

    async fn metrics(&self, tenant: &TenantId, provider: &str) -> CoreResult<LeaseMetrics> {
        match &self.leases {
            Some(leases) => Ok(leases
                .lease_metrics(tenant.as_str(), provider, Utc::now())
                .await?),
            None => Ok(LeaseMetrics::default()),
        }
    }

    async fn clear_expired(&self, tenant: &TenantId, provider: &str) -> CoreResult<u64> {
        // Advisory locks end with their session; only stale bookkeeping rows remain.
        match &self.leases {
            Some(leases) => Ok(leases
                .clear_expired_leases(tenant.as_str(), provider, Utc::now())
                .await?),
            None => Ok(0),
        }
    }
}
