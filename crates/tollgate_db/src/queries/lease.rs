//! Coordination lease queries.
//!
//! Acquisition is one conditional upsert: the row is claimed only when nobody
//! holds it or the previous holder's lease ran out. SQLite serializes writers,
//! so at most one caller sees `rows_affected == 1` for a free lease.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;
use crate::models::{CoordinationLease, CoordinationLeaseRow, LeaseMetrics, LockPurpose, to_millis};

/// Identifies one lease row.
#[derive(Debug, Clone, Copy)]
pub struct LeaseScope<'a> {
    pub tenant_id: &'a str,
    pub provider: &'a str,
    pub purpose: LockPurpose,
}

/// Try to claim a lease for `holder` until `expires_at`.
///
/// Returns true if the lease is now held by `holder`.
pub async fn try_acquire_lease(
    pool: &SqlitePool,
    scope: LeaseScope<'_>,
    lock_key: i64,
    holder: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO coordination_leases (
            tenant_id, provider, purpose, lock_key, locked_by,
            locked_at, expires_at, attempt_count, last_attempt_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?6)
        ON CONFLICT (tenant_id, provider, purpose) DO UPDATE SET
            lock_key = excluded.lock_key,
            locked_by = excluded.locked_by,
            locked_at = excluded.locked_at,
            expires_at = excluded.expires_at,
            attempt_count = coordination_leases.attempt_count + 1,
            last_attempt_at = excluded.last_attempt_at
        WHERE coordination_leases.locked_by = '' OR coordination_leases.expires_at <= ?6
        "#,
    )
    .bind(scope.tenant_id)
    .bind(scope.provider)
    .bind(scope.purpose)
    .bind(lock_key)
    .bind(holder)
    .bind(to_millis(now))
    .bind(to_millis(expires_at))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record an acquisition made through some other mechanism (an advisory lock).
///
/// Unconditionally overwrites the holder and bumps the attempt counter.
pub async fn record_lease_acquired(
    pool: &SqlitePool,
    scope: LeaseScope<'_>,
    lock_key: i64,
    holder: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO coordination_leases (
            tenant_id, provider, purpose, lock_key, locked_by,
            locked_at, expires_at, attempt_count, last_attempt_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?6)
        ON CONFLICT (tenant_id, provider, purpose) DO UPDATE SET
            lock_key = excluded.lock_key,
            locked_by = excluded.locked_by,
            locked_at = excluded.locked_at,
            expires_at = excluded.expires_at,
            attempt_count = coordination_leases.attempt_count + 1,
            last_attempt_at = excluded.last_attempt_at
        "#,
    )
    .bind(scope.tenant_id)
    .bind(scope.provider)
    .bind(scope.purpose)
    .bind(lock_key)
    .bind(holder)
    .bind(to_millis(now))
    .bind(to_millis(expires_at))
    .execute(pool)
    .await?;
    Ok(())
}

/// Release a lease held by `holder`. A lease stolen after expiry is left alone.
///
/// Returns true if `holder` still held it.
pub async fn release_lease(
    pool: &SqlitePool,
    scope: LeaseScope<'_>,
    holder: &str,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE coordination_leases SET locked_by = '', expires_at = ?
        WHERE tenant_id = ? AND provider = ? AND purpose = ? AND locked_by = ?
        "#,
    )
    .bind(to_millis(now))
    .bind(scope.tenant_id)
    .bind(scope.provider)
    .bind(scope.purpose)
    .bind(holder)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Get a lease row.
pub async fn get_lease(
    pool: &SqlitePool,
    scope: LeaseScope<'_>,
) -> DbResult<Option<CoordinationLease>> {
    let row = sqlx::query_as::<_, CoordinationLeaseRow>(
        r#"
        SELECT tenant_id, provider, purpose, lock_key, locked_by,
               locked_at, expires_at, attempt_count, last_attempt_at
        FROM coordination_leases
        WHERE tenant_id = ? AND provider = ? AND purpose = ?
        "#,
    )
    .bind(scope.tenant_id)
    .bind(scope.provider)
    .bind(scope.purpose)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(CoordinationLeaseRow::into_lease))
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseMetricsRow {
    active_leases: i64,
    total_attempts: i64,
    max_attempts: i64,
}

/// Contention counters across every purpose for one (tenant, provider).
pub async fn lease_metrics(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
    now: DateTime<Utc>,
) -> DbResult<LeaseMetrics> {
    let row = sqlx::query_as::<_, LeaseMetricsRow>(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN locked_by != '' AND expires_at > ?1 THEN 1 ELSE 0 END), 0) AS active_leases,
            COALESCE(SUM(attempt_count), 0) AS total_attempts,
            COALESCE(MAX(attempt_count), 0) AS max_attempts
        FROM coordination_leases
        WHERE tenant_id = ?2 AND provider = ?3
        "#,
    )
    .bind(to_millis(now))
    .bind(tenant_id)
    .bind(provider)
    .fetch_one(pool)
    .await?;

    Ok(LeaseMetrics {
        active_leases: row.active_leases,
        total_attempts: row.total_attempts,
        max_attempts: row.max_attempts,
    })
}

/// Clear holders whose lease ran out. Counters are kept.
pub async fn clear_expired_leases(
    pool: &SqlitePool,
    tenant_id: &str,
    provider: &str,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE coordination_leases SET locked_by = ''
        WHERE tenant_id = ? AND provider = ? AND locked_by != '' AND expires_at <= ?
        "#,
    )
    .bind(tenant_id)
    .bind(provider)
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Delete lease rows that are not held and saw no attempt since `idle_before`.
pub async fn purge_idle_leases(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    idle_before: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM coordination_leases
        WHERE (locked_by = '' OR expires_at <= ?) AND last_attempt_at < ?
        "#,
    )
    .bind(to_millis(now))
    .bind(to_millis(idle_before))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
