use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema could not be applied.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Pre-create the file owner-only so there is no window with umask permissions
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.as_os_str().is_empty() || parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    // If creation fails, SQLite reports the error at connect_with.
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok();
                }
            }
        }

        // busy_timeout: wait up to 5 s for the write lock instead of failing with SQLITE_BUSY.
        // Concurrent workers of one run all insert through this pool.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // An in-memory database is private to its connection; pin the pool to one.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // seed_url / seed_interval hold the config values last synced, so an
        // admin edit survives until the config itself changes
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                source_type TEXT NOT NULL CHECK (source_type IN (
                    'blog', 'podcast', 'twitter', 'reddit', 'media', 'creator', 'business_models'
                )),
                description TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_updated INTEGER,
                update_interval INTEGER NOT NULL DEFAULT 3600 CHECK (update_interval > 0),
                metadata TEXT NOT NULL DEFAULT '{}',
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                seed_url TEXT,
                seed_interval INTEGER,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // content_url may be NULL (HTML blocks without links); SQLite treats NULLs as distinct
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                description TEXT,
                content_url TEXT,
                author TEXT,
                published_at INTEGER,
                metrics TEXT NOT NULL DEFAULT '{}',
                enclosure_url TEXT,
                is_paywalled INTEGER NOT NULL DEFAULT 0,
                fingerprint TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(source_id, content_url),
                UNIQUE(source_id, fingerprint)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY,
                content_ids TEXT NOT NULL,
                prompt TEXT NOT NULL,
                summary_text TEXT NOT NULL,
                model_used TEXT NOT NULL,
                tokens_used INTEGER,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_content_source ON content(source_id)")
            .execute(&mut *tx)
            .await?;

        // Retention cleanup filters on COALESCE(published_at, created_at)
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_content_age ON content(COALESCE(published_at, created_at))",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_active ON sources(is_active)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
