//! Short-lived access tokens shared across workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActiveStatus, from_millis};

/// One entry in a tenant's token pool for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub id: String,
    pub tenant_id: String,
    pub provider: String,
    /// SHA-256 of the raw token, hex encoded. Globally unique.
    pub token_hash: String,
    pub encrypted_token: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub is_active: ActiveStatus,
    /// Identity of the worker or caller that produced the token.
    pub generated_by: Option<String>,
    pub generation_context: Option<serde_json::Value>,
}

impl AccessToken {
    /// A token is usable iff it is active and has not reached its expiry.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active == ActiveStatus::Active && now < self.expires_at
    }

    /// Short hash prefix that is safe to put in logs.
    pub fn hash_preview(&self) -> &str {
        self.token_hash.get(..12).unwrap_or(&self.token_hash)
    }
}

/// Which usable token to hand out when several qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSelection {
    /// Most recently created first. Favors tokens least likely to expire mid-use.
    #[default]
    NewestFirst,
    /// Oldest first. Maximizes reuse before natural rotation.
    OldestFirst,
}

impl TokenSelection {
    pub(crate) fn order_clause(&self) -> &'static str {
        match self {
            Self::NewestFirst => "ORDER BY created_at DESC, rowid DESC",
            Self::OldestFirst => "ORDER BY created_at ASC, rowid ASC",
        }
    }
}

/// Row counts for one (tenant, provider) pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenCounts {
    /// Active and not yet expired.
    pub active: i64,
    /// Still flagged active but past expiry (awaiting cleanup).
    pub expired: i64,
    /// Soft-deleted.
    pub inactive: i64,
    pub total: i64,
    pub oldest_active_created_at: Option<DateTime<Utc>>,
}

/// Database row for the `access_tokens` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AccessTokenRow {
    id: String,
    tenant_id: String,
    provider: String,
    token_hash: String,
    encrypted_token: Vec<u8>,
    created_at: i64,
    expires_at: i64,
    last_used_at: Option<i64>,
    usage_count: i64,
    is_active: ActiveStatus,
    generated_by: Option<String>,
    generation_context: Option<String>,
}

impl AccessTokenRow {
    pub(crate) fn into_token(self) -> crate::DbResult<AccessToken> {
        let generation_context = self
            .generation_context
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(AccessToken {
            id: self.id,
            tenant_id: self.tenant_id,
            provider: self.provider,
            token_hash: self.token_hash,
            encrypted_token: self.encrypted_token,
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
            last_used_at: self.last_used_at.map(from_millis),
            usage_count: self.usage_count,
            is_active: self.is_active,
            generated_by: self.generated_by,
            generation_context,
        })
    }
}
