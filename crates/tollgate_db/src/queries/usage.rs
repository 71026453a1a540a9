//! Usage log queries.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;
use crate::models::{UsageLogEntry, UsageLogRow, to_millis};

/// Append an entry to the usage log.
pub async fn append_usage(pool: &SqlitePool, entry: &UsageLogEntry) -> DbResult<()> {
    let context = entry
        .context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO token_usage_log (
            id, tenant_id, provider, token_id, token_hash, operation, outcome,
            used_at, duration_ms, response_status, holder, context
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.tenant_id)
    .bind(&entry.provider)
    .bind(&entry.token_id)
    .bind(&entry.token_hash)
    .bind(&entry.operation)
    .bind(entry.outcome)
    .bind(to_millis(entry.used_at))
    .bind(entry.duration_ms)
    .bind(entry.response_status)
    .bind(&entry.holder)
    .bind(context)
    .execute(pool)
    .await?;
    Ok(())
}

/// Usage entries for one token in a tenant, oldest first.
pub async fn usage_for_token(
    pool: &SqlitePool,
    tenant_id: &str,
    token_id: &str,
) -> DbResult<Vec<UsageLogEntry>> {
    let rows = sqlx::query_as::<_, UsageLogRow>(
        r#"
        SELECT id, tenant_id, provider, token_id, token_hash, operation, outcome,
               used_at, duration_ms, response_status, holder, context
        FROM token_usage_log
        WHERE tenant_id = ? AND token_id = ?
        ORDER BY used_at ASC, rowid ASC
        "#,
    )
    .bind(tenant_id)
    .bind(token_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(UsageLogRow::into_entry).collect()
}

/// Delete usage entries older than `before`.
pub async fn purge_usage_before(pool: &SqlitePool, before: DateTime<Utc>) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM token_usage_log WHERE used_at < ?")
        .bind(to_millis(before))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VaultDb;
    use crate::models::UsageOutcome;
    use chrono::Duration;

    fn entry(token_id: &str, outcome: UsageOutcome, used_at: DateTime<Utc>) -> UsageLogEntry {
        UsageLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "acme".to_string(),
            provider: "shopify".to_string(),
            token_id: token_id.to_string(),
            token_hash: "abc123".to_string(),
            operation: "orders.list".to_string(),
            outcome,
            used_at,
            duration_ms: Some(120),
            response_status: Some(200),
            holder: Some("worker-1".to_string()),
            context: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back_in_order() {
        let db = VaultDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        append_usage(db.pool(), &entry("t1", UsageOutcome::Pending, now - Duration::seconds(5)))
            .await
            .unwrap();
        append_usage(db.pool(), &entry("t1", UsageOutcome::Success, now))
            .await
            .unwrap();
        append_usage(db.pool(), &entry("t2", UsageOutcome::Failed, now))
            .await
            .unwrap();

        let entries = usage_for_token(db.pool(), "acme", "t1").await.unwrap();
        let outcomes: Vec<_> = entries.iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![UsageOutcome::Pending, UsageOutcome::Success]);

        assert!(usage_for_token(db.pool(), "globex", "t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_before_cutoff() {
        let db = VaultDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        append_usage(db.pool(), &entry("t1", UsageOutcome::Success, now - Duration::days(40)))
            .await
            .unwrap();
        append_usage(db.pool(), &entry("t1", UsageOutcome::Success, now))
            .await
            .unwrap();

        let purged = purge_usage_before(db.pool(), now - Duration::days(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(usage_for_token(db.pool(), "acme", "t1").await.unwrap().len(), 1);
    }
}
