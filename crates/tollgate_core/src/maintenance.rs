//! Cross-tenant housekeeping.
//!
//! Meant for an operator job or cron, not the request path. Every step is
//! idempotent and safe to run while workers are dispensing tokens.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tollgate_db::{VaultDb, queries};
use tracing::{info, instrument};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenancePolicy {
    /// Inactive tokens that expired longer ago than this are deleted.
    pub token_retention_minutes: i64,
    pub usage_retention_days: i64,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            token_retention_minutes: 40,
            usage_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub tokens_deactivated: u64,
    pub tokens_deleted: u64,
    pub usage_entries_deleted: u64,
    pub leases_deleted: u64,
}

#[derive(Debug, Clone)]
pub struct Maintenance {
    db: VaultDb,
}

impl Maintenance {
    pub fn new(db: VaultDb) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, policy: MaintenancePolicy) -> CoreResult<MaintenanceReport> {
        if policy.token_retention_minutes < 0 || policy.usage_retention_days < 0 {
            return Err(CoreError::validation("retention windows must not be negative"));
        }

        let now = Utc::now();
        let cutoff = |window: Option<Duration>| {
            window
                .and_then(|window| now.checked_sub_signed(window))
                .ok_or_else(|| CoreError::validation("retention window is out of range"))
        };
        let token_cutoff = cutoff(Duration::try_minutes(policy.token_retention_minutes))?;
        let usage_cutoff = cutoff(Duration::try_days(policy.usage_retention_days))?;

        let pool = self.db.pool();

        let report = MaintenanceReport {
            tokens_deactivated: queries::deactivate_all_expired_tokens(pool, now).await?,
            tokens_deleted: queries::purge_inactive_tokens(pool, token_cutoff).await?,
            usage_entries_deleted: queries::purge_usage_before(pool, usage_cutoff).await?,
            // Idle leases share the token retention window.
            leases_deleted: queries::purge_idle_leases(pool, now, token_cutoff).await?,
        };

        info!(
            tokens_deactivated = report.tokens_deactivated,
            tokens_deleted = report.tokens_deleted,
            usage_entries_deleted = report.usage_entries_deleted,
            leases_deleted = report.leases_deleted,
            "Maintenance completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::TokenPool;
    use crate::test_helpers::{crypto_box, ctx};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_run_sweeps_all_tenants() {
        let db = VaultDb::open_in_memory().await.unwrap();
        let pool = TokenPool::new(db.clone(), crypto_box(), "shopify", PoolConfig::default()).unwrap();

        for tenant in ["acme", "globex"] {
            let ctx = ctx(tenant);
            pool.store(&ctx, &format!("{tenant}-live"), None, None, None)
                .await
                .unwrap();
            pool.store(
                &ctx,
                &format!("{tenant}-dying"),
                None,
                None,
                Some(Utc::now() + Duration::milliseconds(20)),
            )
            .await
            .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let maintenance = Maintenance::new(db);
        let report = maintenance
            .run(MaintenancePolicy {
                token_retention_minutes: 0,
                usage_retention_days: 30,
            })
            .await
            .unwrap();
        assert_eq!(report.tokens_deactivated, 2);
        assert_eq!(report.tokens_deleted, 2);

        let stats = pool.statistics(&ctx("acme")).await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.total, 1);

        let again = maintenance.run(MaintenancePolicy::default()).await.unwrap();
        assert_eq!(again, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_negative_retention_rejected() {
        let db = VaultDb::open_in_memory().await.unwrap();
        let err = Maintenance::new(db)
            .run(MaintenancePolicy {
                token_retention_minutes: -1,
                usage_retention_days: 30,
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let db = VaultDb::open_in_memory().await.unwrap();
        let err = Maintenance::new(db)
            .run(MaintenancePolicy {
                token_retention_minutes: 40,
                usage_retention_days: i64::MAX,
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
