//! Encrypted long-lived credentials.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tollgate_db::{ActiveStatus, Credential, CredentialRepository};
use tracing::{debug, info, instrument};

use crate::context::{RequestContext, ensure_tenant, traced, validate_identifier};
use crate::crypto::{CryptoBox, KeyPurpose};
use crate::error::{CoreError, CoreResult};

/// A credential with its payload decrypted for the duration of one call.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedCredential {
    pub id: String,
    pub system_name: String,
    pub auth_type: String,
    pub payload: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedCredential")
            .field("id", &self.id)
            .field("system_name", &self.system_name)
            .field("auth_type", &self.auth_type)
            .field("payload", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential metadata without the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: String,
    pub system_name: String,
    pub auth_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialSummary {
    fn from_credential(credential: Credential, now: DateTime<Utc>) -> Self {
        Self {
            is_active: credential.is_active(),
            is_expired: credential.is_expired_at(now),
            id: credential.id,
            system_name: credential.system_name,
            auth_type: credential.auth_type,
            expires_at: credential.expires_at,
            created_at: credential.created_at,
            updated_at: credential.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    repo: Arc<dyn CredentialRepository>,
    crypto: CryptoBox,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

fn validate_payload(payload: &serde_json::Value) -> CoreResult<()> {
    match payload.as_object() {
        Some(map) if !map.is_empty() => Ok(()),
        Some(_) => Err(CoreError::validation("credential payload must not be empty")),
        None => Err(CoreError::validation(
            "credential payload must be a JSON object",
        )),
    }
}

impl CredentialStore {
    pub fn new(repo: Arc<dyn CredentialRepository>, crypto: CryptoBox) -> Self {
        Self { repo, crypto }
    }

    fn seal(&self, ctx: &RequestContext, payload: &serde_json::Value) -> CoreResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(payload).map_err(|e| {
            CoreError::service_with_cause("credential.encrypt", "payload serialization failed", e)
        })?;
        Ok(self
            .crypto
            .encrypt(&ctx.tenant, KeyPurpose::Credential, &plaintext)?)
    }

    /// Fetch the row for `system_name`, failing if missing or foreign.
    async fn fetch(
        &self,
        ctx: &RequestContext,
        system_name: &str,
        operation: &'static str,
    ) -> CoreResult<Credential> {
        let credential = self
            .repo
            .get_credential(ctx.tenant_id(), system_name)
            .await?
            .ok_or_else(|| CoreError::not_found("credential", ctx.tenant_id(), system_name))?;
        ensure_tenant(&ctx.tenant, &credential.tenant_id, operation)?;
        Ok(credential)
    }

    /// Store a new credential. Returns its id.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, system_name = %system_name))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        system_name: &str,
        auth_type: &str,
        payload: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        traced(ctx, "credential.create", async {
            validate_identifier("system name", system_name)?;
            validate_identifier("auth type", auth_type)?;
            validate_payload(payload)?;

            let now = Utc::now();
            let credential = Credential {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: ctx.tenant_id().to_string(),
                system_name: system_name.to_string(),
                auth_type: auth_type.to_string(),
                encrypted_payload: self.seal(ctx, payload)?,
                expires_at,
                is_active: ActiveStatus::Active,
                created_at: now,
                updated_at: now,
            };

            self.repo
                .create_credential(&credential)
                .await
                .map_err(|e| CoreError::from_db(e, "credential", system_name))?;

            info!(credential_id = %credential.id, auth_type, "Credential stored");
            Ok(credential.id)
        })
        .await
    }

    /// Decrypt and return a live credential.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, system_name = %system_name))]
    pub async fn get(
        &self,
        ctx: &RequestContext,
        system_name: &str,
    ) -> CoreResult<DecryptedCredential> {
        traced(ctx, "credential.get", async {
            validate_identifier("system name", system_name)?;
            let credential = self.fetch(ctx, system_name, "credential.get").await?;

            if let Some(expired_at) = credential.expires_at {
                if expired_at <= Utc::now() {
                    return Err(CoreError::Expired {
                        tenant_id: ctx.tenant_id().to_string(),
                        system_name: system_name.to_string(),
                        expired_at,
                    });
                }
            }
            if !credential.is_active() {
                return Err(CoreError::Inactive {
                    tenant_id: ctx.tenant_id().to_string(),
                    system_name: system_name.to_string(),
                });
            }

            let plaintext = self.crypto.decrypt(
                &ctx.tenant,
                KeyPurpose::Credential,
                &credential.encrypted_payload,
            )?;
            let payload = serde_json::from_slice(&plaintext).map_err(|e| {
                CoreError::service_with_cause("credential.get", "stored payload is not JSON", e)
            })?;

            info!(
                event = "credential.access",
                credential_id = %credential.id,
                auth_type = %credential.auth_type,
                "Credential accessed"
            );

            Ok(DecryptedCredential {
                id: credential.id,
                system_name: credential.system_name,
                auth_type: credential.auth_type,
                payload,
                expires_at: credential.expires_at,
                created_at: credential.created_at,
                updated_at: credential.updated_at,
            })
        })
        .await
    }

    /// Re-encrypt with a new payload. `None` keeps the current expiry.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, system_name = %system_name))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        system_name: &str,
        payload: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        traced(ctx, "credential.update", async {
            validate_identifier("system name", system_name)?;
            validate_payload(payload)?;
            self.fetch(ctx, system_name, "credential.update").await?;

            let sealed = self.seal(ctx, payload)?;
            let updated = self
                .repo
                .update_credential_payload(
                    ctx.tenant_id(),
                    system_name,
                    &sealed,
                    expires_at,
                    Utc::now(),
                )
                .await?;
            if !updated {
                return Err(CoreError::not_found("credential", ctx.tenant_id(), system_name));
            }

            info!("Credential updated");
            Ok(())
        })
        .await
    }

    /// Hard delete. Returns false if there was nothing to delete.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant, system_name = %system_name))]
    pub async fn delete(&self, ctx: &RequestContext, system_name: &str) -> CoreResult<bool> {
        traced(ctx, "credential.delete", async {
            validate_identifier("system name", system_name)?;
            let deleted = self
                .repo
                .delete_credential(ctx.tenant_id(), system_name)
                .await?;
            if deleted {
                info!("Credential deleted");
            } else {
                debug!("Credential to delete was absent");
            }
            Ok(deleted)
        })
        .await
    }

    /// Soft delete. `get` fails with `Inactive` afterwards.
    pub async fn deactivate(&self, ctx: &RequestContext, system_name: &str) -> CoreResult<bool> {
        traced(ctx, "credential.deactivate", async {
            validate_identifier("system name", system_name)?;
            Ok(self
                .repo
                .set_credential_status(
                    ctx.tenant_id(),
                    system_name,
                    ActiveStatus::Inactive,
                    Utc::now(),
                )
                .await?)
        })
        .await
    }

    /// Metadata for every credential in the tenant, by system name.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        include_expired: bool,
    ) -> CoreResult<Vec<CredentialSummary>> {
        traced(ctx, "credential.list", async {
            let now = Utc::now();
            let credentials = self
                .repo
                .list_credentials(ctx.tenant_id(), include_expired, now)
                .await?;
            self.summarize(ctx, credentials, now, "credential.list")
        })
        .await
    }

    /// Active credentials that expire within the next `minutes`, soonest first.
    ///
    /// Already-expired active credentials are included.
    pub async fn expiring_within(
        &self,
        ctx: &RequestContext,
        minutes: i64,
    ) -> CoreResult<Vec<CredentialSummary>> {
        traced(ctx, "credential.expiring_within", async {
            if minutes < 0 {
                return Err(CoreError::validation("minutes must not be negative"));
            }
            let now = Utc::now();
            let credentials = self
                .repo
                .list_expiring_credentials(ctx.tenant_id(), now + Duration::minutes(minutes))
                .await?;
            self.summarize(ctx, credentials, now, "credential.expiring_within")
        })
        .await
    }

    fn summarize(
        &self,
        ctx: &RequestContext,
        credentials: Vec<Credential>,
        now: DateTime<Utc>,
        operation: &'static str,
    ) -> CoreResult<Vec<CredentialSummary>> {
        credentials
            .into_iter()
            .map(|credential| {
                ensure_tenant(&ctx.tenant, &credential.tenant_id, operation)?;
                Ok(CredentialSummary::from_credential(credential, now))
            })
            .collect()
    }
}
