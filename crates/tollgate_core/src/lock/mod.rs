//! Distributed coordination locks.
//!
//! Workers share nothing but the database, so mutual exclusion around token
//! generation has to live there too. Two implementations:
//! - [`LeaseLock`]: lease rows with a TTL, works on SQLite
//! - `PgAdvisoryLock` (feature `postgres`): native session advisory locks
//!
//! Both are bounded by a timeout; neither blocks indefinitely.

mod lease;
#[cfg(feature = "postgres")]
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tollgate_db::{LeaseMetrics, LeaseScope, LockPurpose};

use crate::config::MAX_WAIT_SECONDS;
use crate::context::TenantId;
use crate::error::CoreResult;

pub use lease::LeaseLock;
#[cfg(feature = "postgres")]
pub use postgres::PgAdvisoryLock;

/// How often a contended lock is retried while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Waits and lease TTLs are clamped to this.
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(MAX_WAIT_SECONDS);

/// Deadline `timeout` from now, clamped to [`MAX_LOCK_WAIT`].
pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + timeout.min(MAX_LOCK_WAIT)
}

/// Identifies one lock: a (tenant, provider, purpose) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    tenant: TenantId,
    provider: String,
    purpose: LockPurpose,
}

impl LockKey {
    pub fn new(tenant: &TenantId, provider: impl Into<String>, purpose: LockPurpose) -> Self {
        Self {
            tenant: tenant.clone(),
            provider: provider.into(),
            purpose,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn purpose(&self) -> LockPurpose {
        self.purpose
    }

    /// Stable integer id for advisory locks, in `0..2^31`.
    pub fn advisory_id(&self) -> i64 {
        let digest = Sha256::digest(
            format!("{}|{}|{}", self.tenant, self.provider, self.purpose).as_bytes(),
        );
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % (1u64 << 31)) as i64
    }

    pub(crate) fn scope(&self) -> LeaseScope<'_> {
        LeaseScope {
            tenant_id: self.tenant.as_str(),
            provider: &self.provider,
            purpose: self.purpose,
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.provider, self.purpose)
    }
}

/// Identity recorded as the lock holder: `worker_<8 hex>_<operation>`.
pub fn holder_id(operation: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker_{}_{operation}", &id[..8])
}

#[async_trait]
pub trait CoordinationLock: Send + Sync + std::fmt::Debug {
    /// Try to take the lock, retrying until `timeout` elapses.
    ///
    /// Returns false on timeout rather than erroring.
    async fn try_acquire(&self, key: &LockKey, holder: &str, timeout: Duration)
    -> CoreResult<bool>;

    /// Release a lock held by `holder`. Returns false if `holder` did not hold it.
    async fn release(&self, key: &LockKey, holder: &str) -> CoreResult<bool>;

    /// Contention counters for one (tenant, provider).
    async fn metrics(&self, tenant: &TenantId, provider: &str) -> CoreResult<LeaseMetrics>;

    /// Clear holders whose lease ran out. Returns how many were cleared.
    async fn clear_expired(&self, tenant: &TenantId, provider: &str) -> CoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_id_is_stable_and_in_range() {
        let acme = TenantId::new("acme").unwrap();
        let key = LockKey::new(&acme, "shopify", LockPurpose::TokenGeneration);
        let again = LockKey::new(&acme, "shopify", LockPurpose::TokenGeneration);
        assert_eq!(key.advisory_id(), again.advisory_id());
        assert!((0..(1i64 << 31)).contains(&key.advisory_id()));

        let cleanup = LockKey::new(&acme, "shopify", LockPurpose::Cleanup);
        assert_ne!(key.advisory_id(), cleanup.advisory_id());

        let globex = TenantId::new("globex").unwrap();
        let other = LockKey::new(&globex, "shopify", LockPurpose::TokenGeneration);
        assert_ne!(key.advisory_id(), other.advisory_id());
    }

    #[tokio::test]
    async fn test_deadline_is_clamped() {
        let start = tokio::time::Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline <= tokio::time::Instant::now() + MAX_LOCK_WAIT);
        assert!(deadline >= start + MAX_LOCK_WAIT);
    }

    #[test]
    fn test_holder_id_format() {
        let holder = holder_id("token_generation");
        assert!(holder.starts_with("worker_"));
        assert!(holder.ends_with("_token_generation"));
        assert_eq!(holder.len(), "worker_".len() + 8 + "_token_generation".len());
        assert_ne!(holder, holder_id("token_generation"));
    }
}
