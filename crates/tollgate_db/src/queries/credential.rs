//! Credential queries.
//!
//! Every query filters on `tenant_id` explicitly; callers still re-check the
//! tenant of each returned row.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use crate::models::{ActiveStatus, Credential, CredentialRow, to_millis};

const CREDENTIAL_COLUMNS: &str = "id, tenant_id, system_name, auth_type, encrypted_payload, \
     expires_at, is_active, created_at, updated_at";

/// Get a credential by system name within a tenant.
pub async fn get_credential(
    pool: &SqlitePool,
    tenant_id: &str,
    system_name: &str,
) -> DbResult<Option<Credential>> {
    let row = sqlx::query_as::<_, CredentialRow>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE tenant_id = ? AND system_name = ?"
    ))
    .bind(tenant_id)
    .bind(system_name)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(CredentialRow::into_credential))
}

/// Insert a new credential. Fails with `AlreadyExists` if the tenant already
/// has one for this system.
pub async fn create_credential(pool: &SqlitePool, credential: &Credential) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO credentials (
            id, tenant_id, system_name, auth_type, encrypted_payload,
            expires_at, is_active, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&credential.id)
    .bind(&credential.tenant_id)
    .bind(&credential.system_name)
    .bind(&credential.auth_type)
    .bind(&credential.encrypted_payload)
    .bind(credential.expires_at.map(to_millis))
    .bind(credential.is_active)
    .bind(to_millis(credential.created_at))
    .bind(to_millis(credential.updated_at))
    .execute(pool)
    .await
    .map_err(|e| DbError::from_insert(e, "credential", &credential.system_name))?;
    Ok(())
}

/// Replace the encrypted payload. A `None` expiry keeps the current one.
///
/// Returns false if no such credential exists.
pub async fn update_credential_payload(
    pool: &SqlitePool,
    tenant_id: &str,
    system_name: &str,
    encrypted_payload: &[u8],
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE credentials
        SET encrypted_payload = ?,
            expires_at = COALESCE(?, expires_at),
            updated_at = ?
        WHERE tenant_id = ? AND system_name = ?
        "#,
    )
    .bind(encrypted_payload)
    .bind(expires_at.map(to_millis))
    .bind(to_millis(now))
    .bind(tenant_id)
    .bind(system_name)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Flip the active flag of a credential.
pub async fn set_credential_status(
    pool: &SqlitePool,
    tenant_id: &str,
    system_name: &str,
    status: ActiveStatus,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let result = sqlx::query(
        "UPDATE credentials SET is_active = ?, updated_at = ? WHERE tenant_id = ? AND system_name = ?",
    )
    .bind(status)
    .bind(to_millis(now))
    .bind(tenant_id)
    .bind(system_name)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Hard-delete a credential. Returns false if it did not exist.
pub async fn delete_credential(
    pool: &SqlitePool,
    tenant_id: &str,
    system_name: &str,
) -> DbResult<bool> {
    let result = sqlx::query("DELETE FROM credentials WHERE tenant_id = ? AND system_name = ?")
        .bind(tenant_id)
        .bind(system_name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// List a tenant's credentials ordered by system name.
pub async fn list_credentials(
    pool: &SqlitePool,
    tenant_id: &str,
    include_expired: bool,
    now: DateTime<Utc>,
) -> DbResult<Vec<Credential>> {
    let rows = if include_expired {
        sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE tenant_id = ? ORDER BY system_name"
        ))
        .bind(tenant_id)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            SELECT {CREDENTIAL_COLUMNS} FROM credentials
            WHERE tenant_id = ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY system_name
            "#
        ))
        .bind(tenant_id)
        .bind(to_millis(now))
        .fetch_all(pool)
        .await?
    };
    Ok(rows.into_iter().map(CredentialRow::into_credential).collect())
}

/// Active credentials with an expiry at or before `before`.
pub async fn list_expiring_credentials(
    pool: &SqlitePool,
    tenant_id: &str,
    before: DateTime<Utc>,
) -> DbResult<Vec<Credential>> {
    let rows = sqlx::query_as::<_, CredentialRow>(&format!(
        r#"
        SELECT {CREDENTIAL_COLUMNS} FROM credentials
        WHERE tenant_id = ?
          AND is_active = 'active'
          AND expires_at IS NOT NULL
          AND expires_at <= ?
        ORDER BY expires_at
        "#
    ))
    .bind(tenant_id)
    .bind(to_millis(before))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(CredentialRow::into_credential).collect())
}
