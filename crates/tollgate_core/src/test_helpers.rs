//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tollgate_db::{
    AccessToken, ActiveStatus, Credential, CredentialRepository, DbResult, TokenCounts,
    TokenRepository, TokenSelection, UsageLogEntry, VaultDb,
};

use crate::context::{RequestContext, TenantId};
use crate::crypto::{CryptoBox, MasterKey};
use crate::generator::{GenerationError, GenerationRequest, TokenGenerator};

pub fn crypto_box() -> CryptoBox {
    CryptoBox::new(MasterKey::from_bytes(&[7u8; 32]).unwrap())
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

pub fn ctx(id: &str) -> RequestContext {
    RequestContext::new(id).unwrap()
}

enum Output {
    Fixed(String),
    Sequence(String),
    Fail,
}

/// Generator that counts its calls.
pub struct CountingGenerator {
    output: Output,
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingGenerator {
    fn with_output(output: Output) -> Self {
        Self {
            output,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always returns `value`.
    pub fn fixed(value: &str) -> Self {
        Self::with_output(Output::Fixed(value.to_string()))
    }

    /// Returns `prefix-1`, `prefix-2`, ...
    pub fn sequence(prefix: &str) -> Self {
        Self::with_output(Output::Sequence(prefix.to_string()))
    }

    pub fn failing() -> Self {
        Self::with_output(Output::Fail)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenGenerator for CountingGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.output {
            Output::Fixed(value) => Ok(value.clone()),
            Output::Sequence(prefix) => Ok(format!("{prefix}-{n}")),
            Output::Fail => Err(GenerationError::with_source(
                "upstream refused",
                std::io::Error::other("503 Service Unavailable"),
            )),
        }
    }
}

/// Repository that stamps every row it reads with another tenant's id.
///
/// Simulates a storage layer that ignored the tenant filter.
pub struct LeakyRepository {
    inner: Arc<VaultDb>,
    foreign_tenant: String,
}

impl LeakyRepository {
    pub fn new(inner: Arc<VaultDb>, foreign_tenant: &str) -> Self {
        Self {
            inner,
            foreign_tenant: foreign_tenant.to_string(),
        }
    }

    fn leak_token(&self, token: Option<AccessToken>) -> Option<AccessToken> {
        token.map(|mut token| {
            token.tenant_id = self.foreign_tenant.clone();
            token
        })
    }
}

#[async_trait]
impl CredentialRepository for LeakyRepository {
    async fn get_credential(
        &self,
        tenant_id: &str,
        system_name: &str,
    ) -> DbResult<Option<Credential>> {
        let credential = self.inner.get_credential(tenant_id, system_name).await?;
        Ok(credential.map(|mut credential| {
            credential.tenant_id = self.foreign_tenant.clone();
            credential
        }))
    }

    async fn create_credential(&self, credential: &Credential) -> DbResult<()> {
        self.inner.create_credential(credential).await
    }

    async fn update_credential_payload(
        &self,
        tenant_id: &str,
        system_name: &str,
        encrypted_payload: &[u8],
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.inner
            .update_credential_payload(tenant_id, system_name, encrypted_payload, expires_at, now)
            .await
    }

    async fn set_credential_status(
        &self,
        tenant_id: &str,
        system_name: &str,
        status: ActiveStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.inner
            .set_credential_status(tenant_id, system_name, status, now)
            .await
    }

    async fn delete_credential(&self, tenant_id: &str, system_name: &str) -> DbResult<bool> {
        self.inner.delete_credential(tenant_id, system_name).await
    }

    async fn list_credentials(
        &self,
        tenant_id: &str,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Credential>> {
        self.inner
            .list_credentials(tenant_id, include_expired, now)
            .await
    }

    async fn list_expiring_credentials(
        &self,
        tenant_id: &str,
        before: DateTime<Utc>,
    ) -> DbResult<Vec<Credential>> {
        self.inner.list_expiring_credentials(tenant_id, before).await
    }
}

#[async_trait]
impl TokenRepository for LeakyRepository {
    async fn find_usable_token(
        &self,
        tenant_id: &str,
        provider: &str,
        min_expiry: DateTime<Utc>,
        selection: TokenSelection,
    ) -> DbResult<Option<AccessToken>> {
        let token = self
            .inner
            .find_usable_token(tenant_id, provider, min_expiry, selection)
            .await?;
        Ok(self.leak_token(token))
    }

    async fn get_token(&self, tenant_id: &str, token_id: &str) -> DbResult<Option<AccessToken>> {
        let token = self.inner.get_token(tenant_id, token_id).await?;
        Ok(self.leak_token(token))
    }

    async fn insert_token(&self, token: &AccessToken) -> DbResult<()> {
        self.inner.insert_token(token).await
    }

    async fn count_active_tokens(&self, tenant_id: &str, provider: &str) -> DbResult<i64> {
        self.inner.count_active_tokens(tenant_id, provider).await
    }

    async fn deactivate_expired_tokens(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        self.inner
            .deactivate_expired_tokens(tenant_id, provider, now)
            .await
    }

    async fn mark_token_used(
        &self,
        tenant_id: &str,
        token_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<i64>> {
        self.inner.mark_token_used(tenant_id, token_id, now).await
    }

    async fn token_counts(
        &self,
        tenant_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<TokenCounts> {
        self.inner.token_counts(tenant_id, provider, now).await
    }

    async fn append_usage(&self, entry: &UsageLogEntry) -> DbResult<()> {
        self.inner.append_usage(entry).await
    }

    async fn usage_for_token(
        &self,
        tenant_id: &str,
        token_id: &str,
    ) -> DbResult<Vec<UsageLogEntry>> {
        self.inner.usage_for_token(tenant_id, token_id).await
    }
}
