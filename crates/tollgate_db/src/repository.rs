//! Repository traits over the vault tables.
//!
//! The core crate talks to storage only through these traits so alternate
//! stores (and test doubles) can be swapped in. [`VaultDb`] implements all of
//! them by delegating to the free functions in [`crate::queries`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::connection::VaultDb;
use crate::error::DbResult;
use crate::models::{
    AccessToken, ActiveStatus, Credential, LeaseMetrics, TokenCounts, TokenSelection,
    UsageLogEntry,
};
use crate::queries::{self, LeaseScope};

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn get_credential(
        &self,
        tenant_id: &str,
        system_name: &str,
    ) -> DbResult<Option<Credential>>;

    async fn create_credential(&self, credential: &Credential) -> DbResult<()>;

    async fn update_credential_payload(
        &self,
        tenant_id: &str,
        system_name: &str,
        encrypted_payload: &[u8],
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn set_credential_status(
        &self,
        tenant_id: &str,
        system_name: &str,
        status: ActiveStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn delete_credential(&self, tenant_id: &str, system_name: &str) -> DbResult<bool>;

    async fn list_credentials(
        &self,
        tenant_id: &str,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Credential>>;

    async fn list_expiring_credentials(
        &self,
        tenant_id: &str,
        before: DateTime<Utc>,
    ) -> DbResult<Vec<Credential>>;
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn find_usable_token(
        &self,
        tenant_id: &str,
        provider: &str,
        min_expiry: DateTime<Utc>,
        selection: TokenSelection,
    ) -> DbResult<Option<AccessToken>>;

    async fn get_token(&self, tenant_id: &str, token_id: &str) -> DbResult<Option<AccessToken>>;

    async fn insert_token(&self, token: &AccessToken) -> DbResult<()>;

    async fn count_active_tokens(&self, tenant_id: &str, provider: &str) -> DbResult<i64>;

    async fn deactivate_expired_tokens(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64>;

    async fn mark_token_used(
        &self,
        tenant_id: &str,
        token_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<i64>>;

    async fn token_counts(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<TokenCounts>;

    async fn append_usage(&self, entry: &UsageLogEntry) -> DbResult<()>;

    async fn usage_for_token(
        &self,
        tenant_id: &str,
        token_id: &str,
    ) -> DbResult<Vec<UsageLogEntry>>;
}

#[async_trait]
pub trait LeaseRepository: Send + Sync {
    async fn try_acquire_lease(
        &self,
        scope: LeaseScope<'_>,
        lock_key: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn record_lease_acquired(
        &self,
        scope: LeaseScope<'_>,
        lock_key: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()>;

    async fn release_lease(
        &self,
        scope: LeaseScope<'_>,
        holder: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn lease_metrics(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<LeaseMetrics>;

    async fn clear_expired_leases(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64>;
}

// ============================================================================
// VaultDb implementations
// ============================================================================

#[async_trait]
impl CredentialRepository for VaultDb {
    async fn get_credential(
        &self,
        tenant_id: &str,
        system_name: &str,
    ) -> DbResult<Option<Credential>> {
        queries::get_credential(self.pool(), tenant_id, system_name).await
    }

    async fn create_credential(&self, credential: &Credential) -> DbResult<()> {
        queries::create_credential(self.pool(), credential).await
    }

    async fn update_credential_payload(
        &self,
        tenant_id: &str,
        system_name: &str,
        encrypted_payload: &[u8],
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        queries::update_credential_payload(
            self.pool(),
            tenant_id,
            system_name,
            encrypted_payload,
            expires_at,
            now,
        )
        .await
    }

    async fn set_credential_status(
        &self,
        tenant_id: &str,
        system_name: &str,
        status: ActiveStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        queries::set_credential_status(self.pool(), tenant_id, system_name, status, now).await
    }

    async fn delete_credential(&self, tenant_id: &str, system_name: &str) -> DbResult<bool> {
        queries::delete_credential(self.pool(), tenant_id, system_name).await
    }

    async fn list_credentials(
        &self,
        tenant_id: &str,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Credential>> {
        queries::list_credentials(self.pool(), tenant_id, include_expired, now).await
    }

    async fn list_expiring_credentials(
        &self,
        tenant_id: &str,
        before: DateTime<Utc>,
    ) -> DbResult<Vec<Credential>> {
        queries::list_expiring_credentials(self.pool(), tenant_id, before).await
    }
}

#[async_trait]
impl TokenRepository for VaultDb {
    async fn find_usable_token(
        &self,
        tenant_id: &str,
        provider: &str,
        min_expiry: DateTime<Utc>,
        selection: TokenSelection,
    ) -> DbResult<Option<AccessToken>> {
        queries::find_usable_token(self.pool(), tenant_id, provider, min_expiry, selection).await
    }

    async fn get_token(&self, tenant_id: &str, token_id: &str) -> DbResult<Option<AccessToken>> {
        queries::get_token(self.pool(), tenant_id, token_id).await
    }

    async fn insert_token(&self, token: &AccessToken) -> DbResult<()> {
        queries::insert_token(self.pool(), token).await
    }

    async fn count_active_tokens(&self, tenant_id: &str, provider: &str) -> DbResult<i64> {
        queries::count_active_tokens(self.pool(), tenant_id, provider).await
    }

    async fn deactivate_expired_tokens(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        queries::deactivate_expired_tokens(self.pool(), tenant_id, provider, now).await
    }

    async fn mark_token_used(
        &self,
        tenant_id: &str,
        token_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<i64>> {
        queries::mark_token_used(self.pool(), tenant_id, token_id, now).await
    }

    async fn token_counts(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<TokenCounts> {
        queries::token_counts(self.pool(), tenant_id, provider, now).await
    }

    async fn append_usage(&self, entry: &UsageLogEntry) -> DbResult<()> {
        queries::append_usage(self.pool(), entry).await
    }

    async fn usage_for_token(
        &self,
        tenant_id: &str,
        token_id: &str,
    ) -> DbResult<Vec<UsageLogEntry>> {
        queries::usage_for_token(self.pool(), tenant_id, token_id).await
    }
}

#[async_trait]
impl LeaseRepository for VaultDb {
    async fn try_acquire_lease(
        &self,
        scope: LeaseScope<'_>,
        lock_key: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        queries::try_acquire_lease(self.pool(), scope, lock_key, holder, now, expires_at).await
    }

    async fn record_lease_acquired(
        &self,
        scope: LeaseScope<'_>,
        lock_key: i64,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()> {
        queries::record_lease_acquired(self.pool(), scope, lock_key, holder, now, expires_at).await
    }

    async fn release_lease(
        &self,
        scope: LeaseScope<'_>,
        holder: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        queries::release_lease(self.pool(), scope, holder, now).await
    }

    async fn lease_metrics(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<LeaseMetrics> {
        queries::lease_metrics(self.pool(), tenant_id, provider, now).await
    }

    async fn clear_expired_leases(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        queries::clear_expired_leases(self.pool(), tenant_id, provider, now).await
    }
}
