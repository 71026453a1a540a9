//! Coordinated access token pool for one provider.
//!
//! `get_valid_token` answers "give me a token I can use right now":
//!
//! 1. Look for a usable token that outlives the expiry buffer. No lock.
//! 2. On a miss, take the generation lock (bounded by `lock_timeout`).
//! 3. Look again. Another worker may have filled the pool while we waited.
//! 4. Still nothing: call the generator, store the token, hand it out.
//! 5. Release the lock on every path.
//!
//! Step 3 is what keeps a burst of callers against an empty pool from each
//! generating their own token. Losers of the race reuse the winner's.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_db::{AccessToken, LockPurpose, UsageLogEntry, UsageOutcome, VaultDb};
use tracing::{debug, info, instrument, warn};

use crate::config::{LockTimeoutPolicy, PoolConfig};
use crate::context::{RequestContext, traced, validate_identifier};
use crate::crypto::CryptoBox;
use crate::error::{CoreError, CoreResult};
use crate::generator::{GenerationRequest, TokenGenerator};
use crate::ledger::{NewToken, TokenLedger};
use crate::lock::{CoordinationLock, LeaseLock, LockKey, holder_id};

/// Where a dispensed token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Reused,
    Generated,
}

/// A token handed to a caller.
#[derive(Clone, PartialEq, Eq)]
pub struct DispensedToken {
    pub value: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
    pub usage_count: i64,
    pub source: TokenSource,
}

impl std::fmt::Debug for DispensedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispensedToken")
            .field("value", &"<redacted>")
            .field("token_id", &self.token_id)
            .field("expires_at", &self.expires_at)
            .field("usage_count", &self.usage_count)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub provider: String,
    pub active: i64,
    pub expired: i64,
    pub inactive: i64,
    pub total: i64,
    pub available_slots: i64,
    /// Age in seconds of the oldest usable token.
    pub oldest_active_token_age_seconds: Option<i64>,
    pub max_tokens: i64,
    pub token_validity_hours: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationMetrics {
    pub active_leases: i64,
    pub total_attempts: i64,
    pub max_attempts: i64,
}

/// Outcome of using a dispensed token, reported back by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub outcome: UsageOutcome,
    pub duration_ms: Option<i64>,
    pub response_status: Option<i64>,
}

pub struct TokenPool {
    provider: String,
    config: PoolConfig,
    ledger: TokenLedger,
    lock: Arc<dyn CoordinationLock>,
    generator: Option<Arc<dyn TokenGenerator>>,
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .field("lock", &self.lock)
            .field("has_generator", &self.generator.is_some())
            .finish()
    }
}

/// A coordination lock taken by this pool.
///
/// Released explicitly on every normal path. If the owning future is dropped
/// first, the release is spawned onto the current runtime instead.
struct HeldLock {
    lock: Arc<dyn CoordinationLock>,
    key: LockKey,
    holder: String,
    released: bool,
}

impl HeldLock {
    async fn release(mut self) {
        release_lock(self.lock.as_ref(), &self.key, &self.holder).await;
        self.released = true;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.key, holder = %self.holder, "No runtime to release abandoned lock; it will expire");
            return;
        };
        let lock = self.lock.clone();
        let key = self.key.clone();
        let holder = std::mem::take(&mut self.holder);
        debug!(lock = %key, holder = %holder, "Releasing lock abandoned mid-request");
        handle.spawn(async move {
            release_lock(lock.as_ref(), &key, &holder).await;
        });
    }
}

async fn release_lock(lock: &dyn CoordinationLock, key: &LockKey, holder: &str) {
    if let Err(e) = lock.release(key, holder).await {
        warn!(lock = %key, holder, error = %e, "Failed to release lock; it will expire");
    }
}

impl TokenPool {
    /// Pool for `provider` over a vault database, locking with lease rows.
    pub fn new(
        db: VaultDb,
        crypto: CryptoBox,
        provider: impl Into<String>,
        config: PoolConfig,
    ) -> CoreResult<Self> {
        let db = Arc::new(db);
        let lock = Arc::new(LeaseLock::new(db.clone(), config.lease_ttl()));
        let ledger = TokenLedger::new(db, crypto).with_selection(config.selection);
        Self::from_parts(provider, config, ledger, lock)
    }

    /// Pool over explicit components.
    pub fn from_parts(
        provider: impl Into<String>,
        config: PoolConfig,
        ledger: TokenLedger,
        lock: Arc<dyn CoordinationLock>,
    ) -> CoreResult<Self> {
        let provider = provider.into();
        validate_identifier("provider", &provider)?;
        config.validate().map_err(|e| {
            CoreError::config("<pool>", format!("providers.{provider}"), "valid pool settings", e)
        })?;
        Ok(Self {
            provider,
            config,
            ledger,
            lock,
            generator: None,
        })
    }

    pub fn with_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn CoordinationLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    /// Hand out a usable token, generating one if the pool is empty.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, provider = %self.provider, operation = %operation))]
    pub async fn get_valid_token(
        &self,
        ctx: &RequestContext,
        operation: &str,
    ) -> CoreResult<DispensedToken> {
        traced(ctx, "token_pool.get_valid_token", async {
            if let Some(token) = self.try_reuse(ctx, operation).await? {
                return Ok(token);
            }

            let key = LockKey::new(&ctx.tenant, &self.provider, LockPurpose::TokenGeneration);
            let holder = holder_id("token_generation");
            let held = self
                .acquire(ctx, &key, &holder, self.config.lock_timeout(), true)
                .await?;

            let result = self.refill(ctx, operation, &holder).await;

            if let Some(held) = held {
                held.release().await;
            }
            result
        })
        .await
    }

    /// Fast path: reuse a token that outlives the expiry buffer.
    async fn try_reuse(
        &self,
        ctx: &RequestContext,
        operation: &str,
    ) -> CoreResult<Option<DispensedToken>> {
        let min_expiry = Utc::now() + self.config.expiry_buffer();
        let Some(token) = self
            .ledger
            .find_usable_after(&ctx.tenant, &self.provider, min_expiry)
            .await?
        else {
            return Ok(None);
        };

        let value = self.ledger.decrypt(&ctx.tenant, &token)?;
        let usage_count = self.ledger.mark_used(&ctx.tenant, &token).await?;
        self.log_dispense(ctx, &token, operation).await;

        info!(
            event = "token.reused",
            token_id = %token.id,
            token_hash = token.hash_preview(),
            usage_count,
            "Reusing pooled token"
        );

        Ok(Some(DispensedToken {
            value,
            token_id: token.id,
            expires_at: token.expires_at,
            usage_count,
            source: TokenSource::Reused,
        }))
    }

    /// Slow path, run with the generation lock held (or not, after a timeout).
    async fn refill(
        &self,
        ctx: &RequestContext,
        operation: &str,
        holder: &str,
    ) -> CoreResult<DispensedToken> {
        if let Some(token) = self.try_reuse(ctx, operation).await? {
            debug!("Pool was refilled while waiting for the lock");
            return Ok(token);
        }

        let Some(generator) = &self.generator else {
            return Err(CoreError::TokenNotAvailable {
                tenant_id: ctx.tenant_id().to_string(),
                provider: self.provider.clone(),
            });
        };

        let request = GenerationRequest {
            tenant_id: ctx.tenant_id().to_string(),
            provider: self.provider.clone(),
            operation: operation.to_string(),
            request_id: ctx.request_id.clone(),
            holder: holder.to_string(),
        };

        let started = Instant::now();
        let raw = generator.generate(&request).await.map_err(|e| {
            CoreError::service_with_cause("token generation", "generator returned an error", e)
        })?;
        if raw.trim().is_empty() {
            return Err(CoreError::service("token generation", "generation failed"));
        }
        let generation_ms = started.elapsed().as_millis() as i64;

        let context = serde_json::json!({
            "operation": operation,
            "request_id": ctx.request_id,
            "generation_ms": generation_ms,
        });
        let token = self
            .store(ctx, &raw, Some(holder), Some(context), None)
            .await?;
        let usage_count = self.ledger.mark_used(&ctx.tenant, &token).await?;
        self.log_dispense(ctx, &token, operation).await;

        info!(
            event = "token.generated",
            token_id = %token.id,
            token_hash = token.hash_preview(),
            generation_ms,
            expires_at = %token.expires_at,
            "Generated new token"
        );

        Ok(DispensedToken {
            value: raw,
            token_id: token.id,
            expires_at: token.expires_at,
            usage_count,
            source: TokenSource::Generated,
        })
    }

    /// Take a lock, applying the timeout policy when `apply_policy` is set.
    ///
    /// `None` means the wait timed out and the caller proceeds without it.
    async fn acquire(
        &self,
        ctx: &RequestContext,
        key: &LockKey,
        holder: &str,
        timeout: std::time::Duration,
        apply_policy: bool,
    ) -> CoreResult<Option<HeldLock>> {
        if self.lock.try_acquire(key, holder, timeout).await? {
            return Ok(Some(HeldLock {
                lock: self.lock.clone(),
                key: key.clone(),
                holder: holder.to_string(),
                released: false,
            }));
        }

        let waited_ms = timeout.as_millis() as u64;
        warn!(
            event = "lock.timeout",
            lock = %key,
            holder,
            waited_ms,
            "Could not acquire {} lock in time", key.purpose()
        );

        if apply_policy && self.config.on_lock_timeout == LockTimeoutPolicy::Fail {
            return Err(CoreError::LockTimeout {
                tenant_id: ctx.tenant_id().to_string(),
                provider: self.provider.clone(),
                purpose: key.purpose().to_string(),
                waited_ms,
            });
        }
        Ok(None)
    }

    async fn log_dispense(&self, ctx: &RequestContext, token: &AccessToken, operation: &str) {
        let entry = UsageLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: ctx.tenant_id().to_string(),
            provider: self.provider.clone(),
            token_id: token.id.clone(),
            token_hash: token.token_hash.clone(),
            operation: operation.to_string(),
            outcome: UsageOutcome::Pending,
            used_at: Utc::now(),
            duration_ms: None,
            response_status: None,
            holder: None,
            context: Some(serde_json::json!({ "request_id": ctx.request_id })),
        };
        self.ledger.append_usage(&entry).await;
    }

    /// Persist a caller-supplied token, enforcing `max_tokens`.
    ///
    /// Expiry defaults to now plus `token_validity_hours`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, provider = %self.provider))]
    pub async fn store(
        &self,
        ctx: &RequestContext,
        raw_token: &str,
        generated_by: Option<&str>,
        context: Option<serde_json::Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AccessToken> {
        if raw_token.trim().is_empty() {
            return Err(CoreError::validation("token must not be empty"));
        }
        let now = Utc::now();
        let expires_at = expires_at.unwrap_or_else(|| now + self.config.token_validity());
        if expires_at <= now {
            return Err(CoreError::validation("token expiry must be in the future"));
        }

        self.enforce_limit(ctx).await?;

        self.ledger
            .insert(
                &ctx.tenant,
                NewToken {
                    provider: &self.provider,
                    raw_token,
                    expires_at,
                    generated_by,
                    context,
                },
            )
            .await
    }

    async fn enforce_limit(&self, ctx: &RequestContext) -> CoreResult<()> {
        let max = self.config.max_tokens;
        let active = self.ledger.count_active(&ctx.tenant, &self.provider).await?;
        if active < max {
            return Ok(());
        }

        let deactivated = self
            .ledger
            .deactivate_expired(&ctx.tenant, &self.provider)
            .await?;
        let active = self.ledger.count_active(&ctx.tenant, &self.provider).await?;
        debug!(deactivated, active, max, "Pool at ceiling, swept expired tokens");

        if active >= max {
            warn!(active, max, "Token limit reached");
            return Err(CoreError::validation(format!(
                "token limit reached for provider '{}' ({active}/{max})",
                self.provider
            )));
        }
        Ok(())
    }

    /// Deactivate expired tokens and clear stale leases.
    ///
    /// Uses the cleanup lock. If another worker holds it, an unforced cleanup
    /// returns 0 and leaves the work to them; a forced one waits longer and
    /// then runs regardless, since deactivation is idempotent.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, provider = %self.provider, force = force))]
    pub async fn cleanup_expired_tokens(&self, ctx: &RequestContext, force: bool) -> CoreResult<u64> {
        traced(ctx, "token_pool.cleanup", async {
            let key = LockKey::new(&ctx.tenant, &self.provider, LockPurpose::Cleanup);
            let holder = holder_id("cleanup");
            let timeout = if force {
                self.config.cleanup_lock_timeout()
            } else {
                self.config.lock_timeout()
            };

            let held = self.acquire(ctx, &key, &holder, timeout, false).await?;
            if held.is_none() && !force {
                return Ok(0);
            }

            let result = self.sweep(ctx).await;

            if let Some(held) = held {
                held.release().await;
            }
            result
        })
        .await
    }

    async fn sweep(&self, ctx: &RequestContext) -> CoreResult<u64> {
        let deactivated = self
            .ledger
            .deactivate_expired(&ctx.tenant, &self.provider)
            .await?;
        let leases = self.lock.clear_expired(&ctx.tenant, &self.provider).await?;
        if deactivated > 0 || leases > 0 {
            info!(deactivated, leases_cleared = leases, "Token cleanup completed");
        }
        Ok(deactivated)
    }

    /// Clear lease holders whose TTL ran out.
    pub async fn cleanup_expired_leases(&self, ctx: &RequestContext) -> CoreResult<u64> {
        traced(ctx, "token_pool.cleanup_leases", async {
            self.lock.clear_expired(&ctx.tenant, &self.provider).await
        })
        .await
    }

    /// Pool counts. Read-only, takes no lock.
    pub async fn statistics(&self, ctx: &RequestContext) -> CoreResult<PoolStatistics> {
        traced(ctx, "token_pool.statistics", async {
            let counts = self.ledger.counts(&ctx.tenant, &self.provider).await?;
            let oldest_active_token_age_seconds = counts
                .oldest_active_created_at
                .map(|created_at| (Utc::now() - created_at).num_seconds());

            Ok(PoolStatistics {
                provider: self.provider.clone(),
                active: counts.active,
                expired: counts.expired,
                inactive: counts.inactive,
                total: counts.total,
                available_slots: (self.config.max_tokens - counts.active).max(0),
                oldest_active_token_age_seconds,
                max_tokens: self.config.max_tokens,
                token_validity_hours: self.config.token_validity_hours,
            })
        })
        .await
    }

    pub async fn coordination_metrics(&self, ctx: &RequestContext) -> CoreResult<CoordinationMetrics> {
        traced(ctx, "token_pool.coordination_metrics", async {
            let metrics = self.lock.metrics(&ctx.tenant, &self.provider).await?;
            Ok(CoordinationMetrics {
                active_leases: metrics.active_leases,
                total_attempts: metrics.total_attempts,
                max_attempts: metrics.max_attempts,
            })
        })
        .await
    }

    /// Record how a dispensed token fared. Best-effort.
    pub async fn report_usage(
        &self,
        ctx: &RequestContext,
        token_id: &str,
        operation: &str,
        report: UsageReport,
    ) -> CoreResult<()> {
        traced(ctx, "token_pool.report_usage", async {
            let token = self
                .ledger
                .get(&ctx.tenant, token_id)
                .await?
                .filter(|token| token.provider == self.provider)
                .ok_or_else(|| CoreError::not_found("access token", ctx.tenant_id(), token_id))?;

            let entry = UsageLogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: ctx.tenant_id().to_string(),
                provider: self.provider.clone(),
                token_id: token.id.clone(),
                token_hash: token.token_hash.clone(),
                operation: operation.to_string(),
                outcome: report.outcome,
                used_at: Utc::now(),
                duration_ms: report.duration_ms,
                response_status: report.response_status,
                holder: None,
                context: Some(serde_json::json!({ "request_id": ctx.request_id })),
            };
            self.ledger.append_usage(&entry).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{CountingGenerator, crypto_box, ctx};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    async fn open_pool(config: PoolConfig) -> TokenPool {
        let db = VaultDb::open_in_memory().await.unwrap();
        TokenPool::new(db, crypto_box(), "shopify", config).unwrap()
    }

    #[tokio::test]
    async fn test_generates_then_reuses() {
        let generator = Arc::new(CountingGenerator::fixed("tok-123"));
        let pool = open_pool(PoolConfig::default())
            .await
            .with_generator(generator.clone());
        let acme = ctx("acme");

        let first = pool.get_valid_token(&acme, "orders.list").await.unwrap();
        assert_eq!(first.value, "tok-123");
        assert_eq!(first.source, TokenSource::Generated);
        assert_eq!(first.usage_count, 1);

        let second = pool.get_valid_token(&acme, "orders.list").await.unwrap();
        assert_eq!(second.value, "tok-123");
        assert_eq!(second.token_id, first.token_id);
        assert_eq!(second.source, TokenSource::Reused);
        assert_eq!(second.usage_count, 2);
        assert_eq!(generator.calls(), 1);

        let usage = pool
            .ledger()
            .usage_for_token(&acme.tenant, &first.token_id)
            .await
            .unwrap();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|e| e.outcome == UsageOutcome::Pending));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_generation() {
        let generator =
            Arc::new(CountingGenerator::sequence("tok").with_delay(std::time::Duration::from_millis(50)));
        let pool = open_pool(PoolConfig::default())
            .await
            .with_generator(generator.clone());
        let (w1, w2, w3) = (ctx("acme"), ctx("acme"), ctx("acme"));
        let (a, b, c) = tokio::join!(
            pool.get_valid_token(&w1, "op"),
            pool.get_valid_token(&w2, "op"),
            pool.get_valid_token(&w3, "op"),
        );

        assert_eq!(generator.calls(), 1);
        let values = [a.unwrap().value, b.unwrap().value, c.unwrap().value];
        assert!(values.iter().all(|v| v == "tok-1"));
    }

    #[tokio::test]
    async fn test_no_generator_is_token_not_available() {
        let pool = open_pool(PoolConfig::default()).await;
        let err = pool.get_valid_token(&ctx("acme"), "op").await.unwrap_err();
        assert!(matches!(err, CoreError::TokenNotAvailable { .. }));
    }

    #[tokio::test]
    async fn test_generator_failures_are_service_errors() {
        let pool = open_pool(PoolConfig::default())
            .await
            .with_generator(Arc::new(CountingGenerator::fixed("")));
        let err = pool.get_valid_token(&ctx("acme"), "op").await.unwrap_err();
        assert!(matches!(err, CoreError::Service { ref message, .. } if message == "generation failed"));

        let pool = pool_with_failing_generator().await;
        let err = pool.get_valid_token(&ctx("acme"), "op").await.unwrap_err();
        assert!(matches!(err, CoreError::Service { cause: Some(_), .. }));
    }

    async fn pool_with_failing_generator() -> TokenPool {
        open_pool(PoolConfig::default())
            .await
            .with_generator(Arc::new(CountingGenerator::failing()))
    }

    #[tokio::test]
    async fn test_near_expiry_token_not_reused() {
        let generator = Arc::new(CountingGenerator::sequence("fresh"));
        let pool = open_pool(PoolConfig::default())
            .await
            .with_generator(generator.clone());
        let acme = ctx("acme");

        // Inside the 20 minute buffer.
        pool.store(&acme, "stale", None, None, Some(Utc::now() + Duration::minutes(10)))
            .await
            .unwrap();

        let token = pool.get_valid_token(&acme, "op").await.unwrap();
        assert_eq!(token.value, "fresh-1");
        assert_eq!(token.source, TokenSource::Generated);
    }

    #[tokio::test]
    async fn test_limit_enforced() {
        let config = PoolConfig {
            max_tokens: 3,
            ..PoolConfig::default()
        };
        let pool = open_pool(config).await;
        let acme = ctx("acme");

        for raw in ["a", "b", "c"] {
            pool.store(&acme, raw, None, None, None).await.unwrap();
        }
        for _ in 0..3 {
            let err = pool.store(&acme, "d", None, None, None).await.unwrap_err();
            assert!(err.is_validation(), "unexpected error: {err}");
        }

        // Other tenants have their own ceiling.
        pool.store(&ctx("globex"), "d", None, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_limit_frees_expired_slots() {
        let config = PoolConfig {
            max_tokens: 2,
            ..PoolConfig::default()
        };
        let pool = open_pool(config).await;
        let acme = ctx("acme");

        pool.store(&acme, "live", None, None, None).await.unwrap();
        pool.store(&acme, "dying", None, None, Some(Utc::now() + Duration::milliseconds(20)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        pool.store(&acme, "new", None, None, None).await.unwrap();
        let stats = pool.statistics(&acme).await.unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.inactive, 1);
        assert_eq!(stats.available_slots, 0);
    }

    #[tokio::test]
    async fn test_store_validation() {
        let pool = open_pool(PoolConfig::default()).await;
        let acme = ctx("acme");
        assert!(pool.store(&acme, "  ", None, None, None).await.unwrap_err().is_validation());
        assert!(
            pool.store(&acme, "x", None, None, Some(Utc::now() - Duration::seconds(1)))
                .await
                .unwrap_err()
                .is_validation()
        );

        let token = pool.store(&acme, "x", Some("ops"), None, None).await.unwrap();
        let validity = token.expires_at - token.created_at;
        assert!(validity > Duration::minutes(59) && validity <= Duration::hours(1));
        assert_eq!(token.generated_by.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_oldest_first_selection() {
        let config = PoolConfig {
            selection: tollgate_db::TokenSelection::OldestFirst,
            ..PoolConfig::default()
        };
        let pool = open_pool(config).await;
        let acme = ctx("acme");
        pool.store(&acme, "first", None, None, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pool.store(&acme, "second", None, None, None).await.unwrap();

        let token = pool.get_valid_token(&acme, "op").await.unwrap();
        assert_eq!(token.value, "first");
    }

    #[tokio::test]
    async fn test_statistics_and_cleanup() {
        let pool = open_pool(PoolConfig::default()).await;
        let acme = ctx("acme");
        pool.store(&acme, "live", None, None, None).await.unwrap();
        pool.store(&acme, "dying", None, None, Some(Utc::now() + Duration::milliseconds(20)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let stats = pool.statistics(&acme).await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.available_slots, 24);
        assert_eq!(stats.max_tokens, 25);
        assert!(stats.oldest_active_token_age_seconds.is_some());

        assert_eq!(pool.cleanup_expired_tokens(&acme, false).await.unwrap(), 1);
        assert_eq!(pool.cleanup_expired_tokens(&acme, true).await.unwrap(), 0);

        let stats = pool.statistics(&acme).await.unwrap();
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.inactive, 1);

        let metrics = pool.coordination_metrics(&acme).await.unwrap();
        assert_eq!(metrics.active_leases, 0);
        assert_eq!(metrics.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_report_usage() {
        let pool = open_pool(PoolConfig::default())
            .await
            .with_generator(Arc::new(CountingGenerator::fixed("tok")));
        let acme = ctx("acme");
        let token = pool.get_valid_token(&acme, "orders.list").await.unwrap();

        pool.report_usage(
            &acme,
            &token.token_id,
            "orders.list",
            UsageReport {
                outcome: UsageOutcome::Success,
                duration_ms: Some(85),
                response_status: Some(200),
            },
        )
        .await
        .unwrap();

        let usage = pool
            .ledger()
            .usage_for_token(&acme.tenant, &token.token_id)
            .await
            .unwrap();
        let outcomes: Vec<_> = usage.iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![UsageOutcome::Pending, UsageOutcome::Success]);
        assert_eq!(usage[1].response_status, Some(200));

        let err = pool
            .report_usage(&ctx("globex"), &token.token_id, "x", UsageReport::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    async fn hold_lock(pool: &TokenPool, tenant: &str, purpose: LockPurpose) {
        let key = LockKey::new(&ctx(tenant).tenant, pool.provider(), purpose);
        assert!(
            pool.lock
                .try_acquire(&key, "someone_else", std::time::Duration::ZERO)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lock_timeout_proceeds_by_default() {
        let config = PoolConfig {
            lock_timeout_seconds: 0,
            ..PoolConfig::default()
        };
        let pool = open_pool(config)
            .await
            .with_generator(Arc::new(CountingGenerator::fixed("tok")));
        hold_lock(&pool, "acme", LockPurpose::TokenGeneration).await;

        let token = pool.get_valid_token(&ctx("acme"), "op").await.unwrap();
        assert_eq!(token.value, "tok");
        assert!(logs_contain("lock.timeout"));
    }

    #[tokio::test]
    async fn test_lock_timeout_fails_when_configured() {
        let config = PoolConfig {
            lock_timeout_seconds: 0,
            on_lock_timeout: LockTimeoutPolicy::Fail,
            ..PoolConfig::default()
        };
        let pool = open_pool(config)
            .await
            .with_generator(Arc::new(CountingGenerator::fixed("tok")));
        hold_lock(&pool, "acme", LockPurpose::TokenGeneration).await;

        let err = pool.get_valid_token(&ctx("acme"), "op").await.unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));

        // A reusable token is still served without touching the lock.
        pool.store(&ctx("acme"), "pooled", None, None, None).await.unwrap();
        let token = pool.get_valid_token(&ctx("acme"), "op").await.unwrap();
        assert_eq!(token.value, "pooled");
    }

    #[tokio::test]
    async fn test_lock_released_after_generation_error() {
        let pool = pool_with_failing_generator().await;
        let acme = ctx("acme");
        assert!(pool.get_valid_token(&acme, "op").await.is_err());

        let key = LockKey::new(&acme.tenant, "shopify", LockPurpose::TokenGeneration);
        assert!(
            pool.lock
                .try_acquire(&key, "next", std::time::Duration::ZERO)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_abandoned_call_releases_lock() {
        let config = PoolConfig {
            lock_timeout_seconds: 0,
            on_lock_timeout: LockTimeoutPolicy::Fail,
            ..PoolConfig::default()
        };
        let generator = Arc::new(
            CountingGenerator::sequence("tok").with_delay(std::time::Duration::from_millis(300)),
        );
        let pool = open_pool(config).await.with_generator(generator.clone());
        let acme = ctx("acme");

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            pool.get_valid_token(&acme, "op"),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The lease TTL is 30s; only an eager release lets this through.
        let token = pool.get_valid_token(&acme, "op").await.unwrap();
        assert_eq!(token.source, TokenSource::Generated);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_usage_log_failure_does_not_fail_dispense() {
        let db = VaultDb::open_in_memory().await.unwrap();
        let pool = TokenPool::new(db.clone(), crypto_box(), "shopify", PoolConfig::default())
            .unwrap()
            .with_generator(Arc::new(CountingGenerator::fixed("tok")));
        sqlx::query("DROP TABLE token_usage_log")
            .execute(db.pool())
            .await
            .unwrap();
        let acme = ctx("acme");

        let generated = pool.get_valid_token(&acme, "op").await.unwrap();
        assert_eq!(generated.source, TokenSource::Generated);
        let reused = pool.get_valid_token(&acme, "op").await.unwrap();
        assert_eq!(reused.source, TokenSource::Reused);
        assert_eq!(reused.usage_count, 2);

        pool.report_usage(&acme, &reused.token_id, "op", UsageReport::default())
            .await
            .unwrap();
        assert!(logs_contain("Failed to log token usage"));
    }

    #[tokio::test]
    async fn test_cleanup_respects_held_cleanup_lock() {
        let config = PoolConfig {
            lock_timeout_seconds: 0,
            cleanup_lock_timeout_seconds: 0,
            ..PoolConfig::default()
        };
        let pool = open_pool(config).await;
        let acme = ctx("acme");
        pool.store(&acme, "dying", None, None, Some(Utc::now() + Duration::milliseconds(20)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        hold_lock(&pool, "acme", LockPurpose::Cleanup).await;

        assert_eq!(pool.cleanup_expired_tokens(&acme, false).await.unwrap(), 0);
        assert_eq!(pool.statistics(&acme).await.unwrap().expired, 1);

        assert_eq!(pool.cleanup_expired_tokens(&acme, true).await.unwrap(), 1);
        let stats = pool.statistics(&acme).await.unwrap();
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.inactive, 1);
    }
}
