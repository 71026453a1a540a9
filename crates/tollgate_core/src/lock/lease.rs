use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tollgate_db::{LeaseMetrics, LeaseRepository};
use tracing::{debug, trace};

use super::{CoordinationLock, DEFAULT_POLL_INTERVAL, LockKey, MAX_LOCK_WAIT, deadline_after};
use crate::context::TenantId;
use crate::error::CoreResult;

/// Lock backed by rows in `coordination_leases`.
///
/// Each successful acquire stamps an expiry `ttl` in the future. A holder that
/// crashes without releasing is superseded once that expiry passes, so the TTL
/// must comfortably exceed the time a generation takes.
#[derive(Clone)]
pub struct LeaseLock {
    leases: Arc<dyn LeaseRepository>,
    ttl: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("ttl", &self.ttl)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl LeaseLock {
    pub fn new(leases: Arc<dyn LeaseRepository>, ttl: Duration) -> Self {
        Self {
            leases,
            ttl,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.ttl.min(MAX_LOCK_WAIT).as_millis() as i64)
    }
}

#[async_trait]
impl CoordinationLock for LeaseLock {
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &str,
        timeout: Duration,
    ) -> CoreResult<bool> {
        let deadline = deadline_after(timeout);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let now = Utc::now();
            let acquired = self
                .leases
                .try_acquire_lease(key.scope(), key.advisory_id(), holder, now, now + self.ttl())
                .await?;

            if acquired {
                debug!(lock = %key, holder, attempts, "Lease acquired");
                return Ok(true);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(lock = %key, holder, attempts, "Lease still held at timeout");
                return Ok(false);
            }
            trace!(lock = %key, holder, "Lease busy, retrying");
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn release(&self, key: &LockKey, holder: &str) -> CoreResult<bool> {
        let released = self
            .leases
            .release_lease(key.scope(), holder, Utc::now())
            .await?;
        if !released {
            debug!(lock = %key, holder, "Lease no longer held by this holder");
        }
        Ok(released)
    }

    async fn metrics(&self, tenant: &TenantId, provider: &str) -> CoreResult<LeaseMetrics> {
        Ok(self
            .leases
            .lease_metrics(tenant.as_str(), provider, Utc::now())
            .await?)
    }

    async fn clear_expired(&self, tenant: &TenantId, provider: &str) -> CoreResult<u64> {
        Ok(self
            .leases
            .clear_expired_leases(tenant.as_str(), provider, Utc::now())
            .await?)
    }
}
