//! Low-level token storage used by the pool.
//!
//! Raw token values only exist in memory between generation and encryption,
//! and again after decryption on dispense. What hits the database is the
//! SHA-256 hash (for uniqueness) and the sealed value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tollgate_db::{
    AccessToken, ActiveStatus, TokenCounts, TokenRepository, TokenSelection, UsageLogEntry,
};
use tracing::{debug, warn};

use crate::context::{TenantId, ensure_tenant};
use crate::crypto::{CryptoBox, KeyPurpose};
use crate::error::{CoreError, CoreResult};

/// Hex SHA-256 of a raw token.
pub fn token_hash(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

/// Fields for a new ledger entry.
#[derive(Debug, Clone)]
pub struct NewToken<'a> {
    pub provider: &'a str,
    pub raw_token: &'a str,
    pub expires_at: DateTime<Utc>,
    pub generated_by: Option<&'a str>,
    pub context: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct TokenLedger {
    tokens: Arc<dyn TokenRepository>,
    crypto: CryptoBox,
    selection: TokenSelection,
}

impl std::fmt::Debug for TokenLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLedger")
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

impl TokenLedger {
    pub fn new(tokens: Arc<dyn TokenRepository>, crypto: CryptoBox) -> Self {
        Self {
            tokens,
            crypto,
            selection: TokenSelection::default(),
        }
    }

    pub fn with_selection(mut self, selection: TokenSelection) -> Self {
        self.selection = selection;
        self
    }

    /// A usable token right now, if any.
    pub async fn find_usable(
        &self,
        tenant: &TenantId,
        provider: &str,
    ) -> CoreResult<Option<AccessToken>> {
        self.find_usable_after(tenant, provider, Utc::now()).await
    }

    /// A usable token that stays valid past `min_expiry`.
    pub async fn find_usable_after(
        &self,
        tenant: &TenantId,
        provider: &str,
        min_expiry: DateTime<Utc>,
    ) -> CoreResult<Option<AccessToken>> {
        let token = self
            .tokens
            .find_usable_token(tenant.as_str(), provider, min_expiry, self.selection)
            .await?;
        if let Some(token) = &token {
            ensure_tenant(tenant, &token.tenant_id, "token.find_usable")?;
        }
        Ok(token)
    }

    pub async fn get(&self, tenant: &TenantId, token_id: &str) -> CoreResult<Option<AccessToken>> {
        let token = self.tokens.get_token(tenant.as_str(), token_id).await?;
        if let Some(token) = &token {
            ensure_tenant(tenant, &token.tenant_id, "token.get")?;
        }
        Ok(token)
    }

    /// Hash, encrypt and persist a raw token.
    ///
    /// A hash that already exists anywhere, in any tenant, is a `Duplicate`.
    pub async fn insert(&self, tenant: &TenantId, new: NewToken<'_>) -> CoreResult<AccessToken> {
        let hash = token_hash(new.raw_token);
        let encrypted_token = self
            .crypto
            .encrypt_str(tenant, KeyPurpose::Token, new.raw_token)?;

        let token = AccessToken {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.as_str().to_string(),
            provider: new.provider.to_string(),
            token_hash: hash,
            encrypted_token,
            created_at: Utc::now(),
            expires_at: new.expires_at,
            last_used_at: None,
            usage_count: 0,
            is_active: ActiveStatus::Active,
            generated_by: new.generated_by.map(str::to_string),
            generation_context: new.context,
        };

        self.tokens
            .insert_token(&token)
            .await
            .map_err(|e| CoreError::from_db(e, "access token", token.hash_preview()))?;

        debug!(
            tenant_id = %tenant,
            provider = new.provider,
            token_id = %token.id,
            token_hash = token.hash_preview(),
            "Token inserted"
        );
        Ok(token)
    }

    pub async fn count_active(&self, tenant: &TenantId, provider: &str) -> CoreResult<i64> {
        Ok(self
            .tokens
            .count_active_tokens(tenant.as_str(), provider)
            .await?)
    }

    /// Soft-delete expired tokens. Returns how many rows changed.
    pub async fn deactivate_expired(&self, tenant: &TenantId, provider: &str) -> CoreResult<u64> {
        Ok(self
            .tokens
            .deactivate_expired_tokens(tenant.as_str(), provider, Utc::now())
            .await?)
    }

    /// Record a use. Returns the new usage count.
    pub async fn mark_used(&self, tenant: &TenantId, token: &AccessToken) -> CoreResult<i64> {
        ensure_tenant(tenant, &token.tenant_id, "token.mark_used")?;
        self.tokens
            .mark_token_used(tenant.as_str(), &token.id, Utc::now())
            .await?
            .ok_or_else(|| CoreError::not_found("access token", tenant.as_str(), &token.id))
    }

    /// Append to the usage log. Failures are logged and swallowed.
    pub async fn append_usage(&self, entry: &UsageLogEntry) {
        if let Err(e) = self.tokens.append_usage(entry).await {
            warn!(
                tenant_id = %entry.tenant_id,
                provider = %entry.provider,
                token_id = %entry.token_id,
                operation = %entry.operation,
                error = %e,
                "Failed to log token usage"
            );
        }
    }

    pub async fn usage_for_token(
        &self,
        tenant: &TenantId,
        token_id: &str,
    ) -> CoreResult<Vec<UsageLogEntry>> {
        let entries = self.tokens.usage_for_token(tenant.as_str(), token_id).await?;
        for entry in &entries {
            ensure_tenant(tenant, &entry.tenant_id, "token.usage")?;
        }
        Ok(entries)
    }

    pub async fn counts(&self, tenant: &TenantId, provider: &str) -> CoreResult<TokenCounts> {
        Ok(self
            .tokens
            .token_counts(tenant.as_str(), provider, Utc::now())
            .await?)
    }

    /// Recover the raw token value.
    pub fn decrypt(&self, tenant: &TenantId, token: &AccessToken) -> CoreResult<String> {
        ensure_tenant(tenant, &token.tenant_id, "token.decrypt")?;
        Ok(self
            .crypto
            .decrypt_string(tenant, KeyPurpose::Token, &token.encrypted_token)?)
    }
}
