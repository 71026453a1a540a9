//! Database connection management.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::DbResult;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the shared vault database.
///
/// Every worker opens its own handle against the same file. Nothing is kept in
/// memory between calls; all coordination goes through the tables:
/// - `credentials` - encrypted long-lived secrets
/// - `access_tokens` - encrypted short-lived tokens
/// - `token_usage_log` - append-only audit trail
/// - `coordination_leases` - lease rows used for locking and contention metrics
#[derive(Debug, Clone)]
pub struct VaultDb {
    pool: SqlitePool,
}

impl VaultDb {
    /// Open or create a vault database at the given path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run any pending migrations
    /// 3. Configure SQLite for concurrent workers (WAL mode, busy timeout)
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists())
        {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening vault database: {}", path.to_string_lossy());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .pragma("cache_size", "-16000") // 16MB cache
            .pragma("synchronous", "NORMAL") // Safe with WAL
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        debug!("Vault database connection established");

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // In-memory must be single connection to share state
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
        debug!("Running vault database migrations");
        sqlx::migrate!("./migrations").run(pool).await?;
        info!("Vault database migrations complete");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = VaultDb::open_in_memory().await.unwrap();
        db.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_file_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vault.db");

        let first = VaultDb::open(&path).await.unwrap();
        sqlx::query(
            "INSERT INTO coordination_leases (tenant_id, provider, purpose, lock_key, locked_at, expires_at, last_attempt_at) VALUES ('t', 'p', 'x', 1, 0, 0, 0)",
        )
        .execute(first.pool())
        .await
        .unwrap();

        // A second handle (another worker) sees the same rows.
        let second = VaultDb::open(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM coordination_leases")
            .fetch_one(second.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
