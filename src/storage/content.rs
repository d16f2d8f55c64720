use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{ContentItem, ContentRow, DatabaseError, NewContent};
use crate::dedup::Fingerprint;

const CONTENT_COLUMNS: &str = "id, source_id, title, description, content_url, author, \
     published_at, metrics, enclosure_url, is_paywalled, fingerprint, created_at";

impl Database {
    // ========================================================================
    // Content Operations
    // ========================================================================

    /// Insert a content item unless it collides with an existing row.
    ///
    /// Returns `true` if a row was written, `false` if the
    /// `(source_id, content_url)` or `(source_id, fingerprint)` constraint
    /// already held a matching item.
    pub async fn insert_content(&self, item: &NewContent) -> Result<bool, DatabaseError> {
        let metrics = serde_json::to_string(&item.metrics)
            .map_err(|e| DatabaseError::Validation(format!("metrics not serializable: {e}")))?;
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO content (source_id, title, description, content_url, author,
                                 published_at, metrics, enclosure_url, is_paywalled,
                                 fingerprint, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
        "#,
        )
        .bind(item.source_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.content_url)
        .bind(&item.author)
        .bind(item.published_at)
        .bind(&metrics)
        .bind(&item.enclosure_url)
        .bind(item.is_paywalled)
        .bind(item.fingerprint.key())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Look up a stored item of `source_id` by fingerprint.
    pub async fn content_by_fingerprint(
        &self,
        source_id: i64,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ContentItem>, DatabaseError> {
        let row: Option<ContentRow> = sqlx::query_as(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content WHERE source_id = ? AND fingerprint = ?"
        ))
        .bind(source_id)
        .bind(fingerprint.key())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ContentRow::into_item))
    }

    /// Fetch items by id, in the order the ids were given. Unknown ids are skipped.
    pub async fn content_by_ids(&self, ids: &[i64]) -> Result<Vec<ContentItem>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {CONTENT_COLUMNS} FROM content WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows: Vec<ContentRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        let mut items: Vec<ContentItem> = rows.into_iter().map(ContentRow::into_item).collect();
        items.sort_by_key(|item| ids.iter().position(|id| *id == item.id));
        Ok(items)
    }

    /// Newest items of a source, most recent first.
    pub async fn content_for_source(
        &self,
        source_id: i64,
        limit: i64,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        let rows: Vec<ContentRow> = sqlx::query_as(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content WHERE source_id = ?
             ORDER BY COALESCE(published_at, created_at) DESC, id DESC LIMIT ?"
        ))
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ContentRow::into_item).collect())
    }

    pub async fn count_content(&self, source_id: Option<i64>) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = match source_id {
            Some(id) => {
                sqlx::query_as("SELECT COUNT(*) FROM content WHERE source_id = ?")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM content")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete content older than `days` days, judged by publish date (or
    /// ingestion date when the feed gave none). Returns the number of rows
    /// removed.
    pub async fn cleanup_old_content(&self, days: u32) -> Result<u64, DatabaseError> {
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * 86_400;
        self.delete_content_before(cutoff).await
    }

    pub(crate) async fn delete_content_before(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM content WHERE COALESCE(published_at, created_at) < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        tracing::info!(deleted = result.rows_affected(), cutoff, "Removed expired content");
        Ok(result.rows_affected())
    }
}
