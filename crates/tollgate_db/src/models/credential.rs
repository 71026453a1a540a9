//! Long-lived third-party credentials.

use chrono::{DateTime, Utc};

use super::{ActiveStatus, from_millis};

/// A stored credential for one external system within one tenant.
///
/// The payload is opaque ciphertext here; decryption happens in the core
/// crate on demand and is never written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub tenant_id: String,
    /// Unique per tenant.
    pub system_name: String,
    /// Free-form auth kind, e.g. `api_token` or `oauth`.
    pub auth_type: String,
    pub encrypted_payload: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: ActiveStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Whether `expires_at` has passed at `now`. Credentials without an expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_active(&self) -> bool {
        self.is_active == ActiveStatus::Active
    }
}

/// Database row for the `credentials` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CredentialRow {
    id: String,
    tenant_id: String,
    system_name: String,
    auth_type: String,
    encrypted_payload: Vec<u8>,
    expires_at: Option<i64>,
    is_active: ActiveStatus,
    created_at: i64,
    updated_at: i64,
}

impl CredentialRow {
    pub(crate) fn into_credential(self) -> Credential {
        Credential {
            id: self.id,
            tenant_id: self.tenant_id,
            system_name: self.system_name,
            auth_type: self.auth_type,
            encrypted_payload: self.encrypted_payload,
            expires_at: self.expires_at.map(from_millis),
            is_active: self.is_active,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}
