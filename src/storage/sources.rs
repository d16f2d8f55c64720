use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, NewSource, Source, SourceRow};

const SOURCE_COLUMNS: &str = "id, name, url, source_type, description, is_active, last_updated, \
     update_interval, metadata, consecutive_failures, last_error";

impl Database {
    // ========================================================================
    // Source Administration
    // ========================================================================

    /// Threshold for consecutive failures before a source is skipped
    pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 5;

    /// Insert a new source and return its id.
    ///
    /// Fails with `DatabaseError::Validation` if the record breaks a field
    /// invariant, or `DatabaseError::Other` if the name is already taken.
    pub async fn add_source(&self, source: &NewSource) -> Result<i64, DatabaseError> {
        let metadata = source.validate()?.to_json()?;
        let now = chrono::Utc::now().timestamp();

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (name, url, source_type, description, update_interval, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(source.name.trim())
        .bind(source.url.trim())
        .bind(source.source_type.as_str())
        .bind(&source.description)
        .bind(source.update_interval)
        .bind(&metadata)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Sync the configured seed list, matching existing sources by name.
    ///
    /// Existing rows keep their fetch history (last_updated, failure count)
    /// and their active flag, so a deactivated source stays deactivated.
    /// `url` and `update_interval` are only overwritten when the config value
    /// differs from the one last synced; otherwise admin edits are kept.
    /// Batched in chunks of 100.
    pub async fn sync_sources(&self, sources: &[NewSource]) -> Result<(), DatabaseError> {
        if sources.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::with_capacity(sources.len());
        for source in sources {
            let metadata = source.validate()?.to_json()?;
            rows.push((source, metadata));
        }

        const BATCH_SIZE: usize = 100;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO sources (name, url, source_type, description, update_interval, metadata, \
                 seed_url, seed_interval, created_at) ",
            );

            builder.push_values(chunk, |mut b, (source, metadata)| {
                b.push_bind(source.name.trim())
                    .push_bind(source.url.trim())
                    .push_bind(source.source_type.as_str())
                    .push_bind(&source.description)
                    .push_bind(source.update_interval)
                    .push_bind(metadata)
                    .push_bind(source.url.trim())
                    .push_bind(source.update_interval)
                    .push_bind(now);
            });

            // Right-hand sides see the row as it was before the update
            builder.push(
                " ON CONFLICT(name) DO UPDATE SET \
                 url = CASE WHEN excluded.seed_url IS sources.seed_url \
                     THEN sources.url ELSE excluded.url END, \
                 update_interval = CASE WHEN excluded.seed_interval IS sources.seed_interval \
                     THEN sources.update_interval ELSE excluded.update_interval END, \
                 seed_url = excluded.seed_url, seed_interval = excluded.seed_interval, \
                 source_type = excluded.source_type, description = excluded.description, \
                 metadata = excluded.metadata",
            );

            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All sources, active or not, ordered by name.
    pub async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(SourceRow::into_source).collect()
    }

    /// Active sources, ordered by id.
    pub async fn active_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE is_active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SourceRow::into_source).collect()
    }

    pub async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, DatabaseError> {
        let row: Option<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = ?"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        row.map(SourceRow::into_source).transpose()
    }

    /// Soft-deactivate a source. Returns false if no source has that name.
    pub async fn deactivate_source(&self, name: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE sources SET is_active = 0 WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set last_updated for a source that finished a run.
    pub async fn set_source_last_updated(
        &self,
        source_id: i64,
        timestamp: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sources SET last_updated = ? WHERE id = ?")
            .bind(timestamp)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Circuit Breaker Operations
    // ========================================================================

    /// Increment the consecutive failure count and record the error text.
    ///
    /// Returns the new failure count. When it reaches
    /// [`Self::CIRCUIT_BREAKER_THRESHOLD`], scheduled runs skip the source
    /// until [`Self::reset_source_failures`] is called.
    pub async fn increment_source_failures(
        &self,
        source_id: i64,
        error: &str,
    ) -> Result<i64, DatabaseError> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE sources SET consecutive_failures = consecutive_failures + 1, last_error = ?
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(error)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Clear the circuit breaker state for a source.
    pub async fn reset_source_failures(&self, source_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sources SET consecutive_failures = 0, last_error = NULL WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, DatabaseError, NewSource, SourceMetadata, SourceType};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_source(id: i64) -> NewSource {
        NewSource::new(
            format!("Source {}", id),
            format!("https://feed{}.example.com/rss", id),
            SourceType::Blog,
        )
    }

    #[tokio::test]
    async fn test_add_source_and_list() {
        let db = test_db().await;
        let id = db.add_source(&test_source(1)).await.unwrap();

        let sources = db.list_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, id);
        assert_eq!(sources[0].name, "Source 1");
        assert!(sources[0].is_active);
        assert_eq!(sources[0].last_updated, None);
        assert_eq!(sources[0].update_interval, 3600);
        assert_eq!(
            sources[0].metadata,
            SourceMetadata::default_for(SourceType::Blog)
        );
    }

    #[tokio::test]
    async fn test_add_source_duplicate_name_fails() {
        let db = test_db().await;
        db.add_source(&test_source(1)).await.unwrap();
        assert!(db.add_source(&test_source(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_add_source_rejects_invalid_interval() {
        let db = test_db().await;
        let mut source = test_source(1);
        source.update_interval = -5;
        assert!(matches!(
            db.add_source(&source).await,
            Err(DatabaseError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_sources_applies_config_changes() {
        let db = test_db().await;
        db.sync_sources(&[test_source(1), test_source(2)]).await.unwrap();

        let id = db.find_source_by_name("Source 1").await.unwrap().unwrap().id;
        db.set_source_last_updated(id, 1_700_000_000).await.unwrap();

        let mut updated = test_source(1);
        updated.url = "https://moved.example.com/rss".into();
        updated.update_interval = 7200;
        db.sync_sources(&[updated]).await.unwrap();

        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert_eq!(source.id, id);
        assert_eq!(source.url, "https://moved.example.com/rss");
        assert_eq!(source.update_interval, 7200);
        assert_eq!(source.last_updated, Some(1_700_000_000));
        assert_eq!(db.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivation_survives_resync() {
        let db = test_db().await;
        let seed = [test_source(1), test_source(2)];
        db.sync_sources(&seed).await.unwrap();

        assert!(db.deactivate_source("Source 1").await.unwrap());
        db.sync_sources(&seed).await.unwrap();

        let active: Vec<String> = db
            .active_sources()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(active, vec!["Source 2".to_string()]);

        // Even when the config entry itself changes
        let mut edited = test_source(1);
        edited.update_interval = 900;
        db.sync_sources(&[edited]).await.unwrap();
        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert!(!source.is_active);
        assert_eq!(source.update_interval, 900);
    }

    #[tokio::test]
    async fn test_admin_edits_kept_while_config_unchanged() {
        let db = test_db().await;
        let seed = [test_source(1)];
        db.sync_sources(&seed).await.unwrap();

        sqlx::query(
            "UPDATE sources SET url = 'https://mirror.example.com/rss', update_interval = 600 \
             WHERE name = 'Source 1'",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        db.sync_sources(&seed).await.unwrap();
        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert_eq!(source.url, "https://mirror.example.com/rss");
        assert_eq!(source.update_interval, 600);

        // A changed config value wins over the edit
        let mut changed = test_source(1);
        changed.url = "https://new.example.com/rss".into();
        db.sync_sources(&[changed]).await.unwrap();
        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert_eq!(source.url, "https://new.example.com/rss");
        assert_eq!(source.update_interval, 600);
    }

    #[tokio::test]
    async fn test_sync_adopts_source_added_from_cli() {
        let db = test_db().await;
        let mut added = test_source(1);
        added.update_interval = 600;
        db.add_source(&added).await.unwrap();

        // No seed recorded yet, so the config values apply
        db.sync_sources(&[test_source(1)]).await.unwrap();
        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert_eq!(source.update_interval, 3600);
    }

    #[tokio::test]
    async fn test_sync_sources_batch_chunking() {
        let db = test_db().await;
        let sources: Vec<NewSource> = (0..250).map(test_source).collect();
        db.sync_sources(&sources).await.unwrap();
        assert_eq!(db.list_sources().await.unwrap().len(), 250);
    }

    #[tokio::test]
    async fn test_deactivate_hides_from_active() {
        let db = test_db().await;
        db.add_source(&test_source(1)).await.unwrap();
        db.add_source(&test_source(2)).await.unwrap();

        assert!(db.deactivate_source("Source 2").await.unwrap());
        assert!(!db.deactivate_source("Missing").await.unwrap());

        let active = db.active_sources().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Source 1");
        assert_eq!(db.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_circuit_breaker_counts_and_resets() {
        let db = test_db().await;
        let id = db.add_source(&test_source(1)).await.unwrap();

        assert_eq!(db.increment_source_failures(id, "timeout").await.unwrap(), 1);
        assert_eq!(db.increment_source_failures(id, "HTTP 503").await.unwrap(), 2);

        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 2);
        assert_eq!(source.last_error.as_deref(), Some("HTTP 503"));

        db.reset_source_failures(id).await.unwrap();
        let source = db.find_source_by_name("Source 1").await.unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 0);
        assert_eq!(source.last_error, None);
    }
}
