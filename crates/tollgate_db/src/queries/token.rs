//! Access token queries.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use crate::models::{AccessToken, AccessTokenRow, TokenCounts, TokenSelection, from_millis, to_millis};

const TOKEN_COLUMNS: &str = "id, tenant_id, provider, token_hash, encrypted_token, created_at, \
     expires_at, last_used_at, usage_count, is_active, generated_by, generation_context";

/// Find one usable token whose expiry is strictly after `min_expiry`.
///
/// Callers pass `now + buffer` so a dispensed token has time left to be used.
pub async fn find_usable_token(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
    min_expiry: DateTime<Utc>,
    selection: TokenSelection,
) -> DbResult<Option<AccessToken>> {
    let row = sqlx::query_as::<_, AccessTokenRow>(&format!(
        r#"
        SELECT {TOKEN_COLUMNS} FROM access_tokens
        WHERE tenant_id = ? AND provider = ? AND is_active = 'active' AND expires_at > ?
        {}
        LIMIT 1
        "#,
        selection.order_clause()
    ))
    .bind(tenant_id)
    .bind(provider)
    .bind(to_millis(min_expiry))
    .fetch_optional(pool)
    .await?;
    row.map(AccessTokenRow::into_token).transpose()
}

/// Get a token by id within a tenant.
pub async fn get_token(
    pool: &SqlitePool,
    tenant_id: &str,
    token_id: &str,
) -> DbResult<Option<AccessToken>> {
    let row = sqlx::query_as::<_, AccessTokenRow>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE tenant_id = ? AND id = ?"
    ))
    .bind(tenant_id)
    .bind(token_id)
    .fetch_optional(pool)
    .await?;
    row.map(AccessTokenRow::into_token).transpose()
}

/// Insert a token. A duplicate `token_hash` fails with `AlreadyExists`.
pub async fn insert_token(pool: &SqlitePool, token: &AccessToken) -> DbResult<()> {
    let generation_context = token
        .generation_context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO access_tokens (
            id, tenant_id, provider, token_hash, encrypted_token, created_at,
            expires_at, last_used_at, usage_count, is_active, generated_by, generation_context
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&token.id)
    .bind(&token.tenant_id)
    .bind(&token.provider)
    .bind(&token.token_hash)
    .bind(&token.encrypted_token)
    .bind(to_millis(token.created_at))
    .bind(to_millis(token.expires_at))
    .bind(token.last_used_at.map(to_millis))
    .bind(token.usage_count)
    .bind(token.is_active)
    .bind(&token.generated_by)
    .bind(generation_context)
    .execute(pool)
    .await
    .map_err(|e| DbError::from_insert(e, "access token", token.hash_preview()))?;
    Ok(())
}

/// Number of rows flagged active, expired or not.
///
/// Rows past expiry still occupy a slot until `deactivate_expired_tokens`
/// runs, which is what the pool limit is enforced against.
pub async fn count_active_tokens(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
) -> DbResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM access_tokens WHERE tenant_id = ? AND provider = ? AND is_active = 'active'",
    )
    .bind(tenant_id)
    .bind(provider)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Flip active tokens at or past expiry to inactive. Returns rows changed.
pub async fn deactivate_expired_tokens(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE access_tokens SET is_active = 'inactive'
        WHERE tenant_id = ? AND provider = ? AND is_active = 'active' AND expires_at <= ?
        "#,
    )
    .bind(tenant_id)
    .bind(provider)
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Same as [`deactivate_expired_tokens`] across every tenant and provider.
pub async fn deactivate_all_expired_tokens(pool: &SqlitePool, now: DateTime<Utc>) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE access_tokens SET is_active = 'inactive' WHERE is_active = 'active' AND expires_at <= ?",
    )
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Delete inactive tokens that expired before `expired_before`.
pub async fn purge_inactive_tokens(
    pool: &SqlitePool,
    expired_before: DateTime<Utc>,
) -> DbResult<u64> {
    let result =
        sqlx::query("DELETE FROM access_tokens WHERE is_active = 'inactive' AND expires_at < ?")
            .bind(to_millis(expired_before))
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

/// Bump the usage counter and stamp `last_used_at`.
///
/// Returns the new usage count, or `None` if the token does not exist in this
/// tenant. The increment is a single statement so concurrent callers never
/// lose an update.
pub async fn mark_token_used(
    pool: &SqlitePool,
    tenant_id: &str,
    token_id: &str,
    now: DateTime<Utc>,
) -> DbResult<Option<i64>> {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE access_tokens
        SET usage_count = usage_count + 1, last_used_at = ?
        WHERE tenant_id = ? AND id = ?
        RETURNING usage_count
        "#,
    )
    .bind(to_millis(now))
    .bind(tenant_id)
    .bind(token_id)
    .fetch_optional(pool)
    .await?;
    Ok(count)
}

#[derive(Debug, sqlx::FromRow)]
struct TokenCountsRow {
    active: i64,
    expired: i64,
    inactive: i64,
    total: i64,
    oldest_active: Option<i64>,
}

/// Pool counts for one (tenant, provider) as seen at `now`.
pub async fn token_counts(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
    now: DateTime<Utc>,
) -> DbResult<TokenCounts> {
    let row = sqlx::query_as::<_, TokenCountsRow>(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN is_active = 'active' AND expires_at > ?1 THEN 1 ELSE 0 END), 0) AS active,
            COALESCE(SUM(CASE WHEN is_active = 'active' AND expires_at <= ?1 THEN 1 ELSE 0 END), 0) AS expired,
            COALESCE(SUM(CASE WHEN is_active = 'inactive' THEN 1 ELSE 0 END), 0) AS inactive,
            COUNT(*) AS total,
            MIN(CASE WHEN is_active = 'active' AND expires_at > ?1 THEN created_at END) AS oldest_active
        FROM access_tokens
        WHERE tenant_id = ?2 AND provider = ?3
        "#,
    )
    .bind(to_millis(now))
    .bind(tenant_id)
    .bind(provider)
    .fetch_one(pool)
    .await?;

    Ok(TokenCounts {
        active: row.active,
        expired: row.expired,
        inactive: row.inactive,
        total: row.total,
        oldest_active_created_at: row.oldest_active.map(from_millis),
    })
}

/// All tokens for a (tenant, provider), newest first.
pub async fn list_tokens(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
) -> DbResult<Vec<AccessToken>> {
    let rows = sqlx::query_as::<_, AccessTokenRow>(&format!(
        r#"
        SELECT {TOKEN_COLUMNS} FROM access_tokens
        WHERE tenant_id = ? AND provider = ?
        ORDER BY created_at DESC, rowid DESC
        "#
    ))
    .bind(tenant_id)
    .bind(provider)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(AccessTokenRow::into_token).collect()
}
