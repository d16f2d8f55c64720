use async_trait::async_trait;

use super::schema::Database;
use super::types::{ContentItem, DatabaseError, NewContent, Source};
use crate::dedup::Fingerprint;

/// The record store the ingestion pipeline writes to.
///
/// `Database` is the production implementation; tests substitute their own
/// to inject failures.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Sources with `is_active` set.
    async fn get_active_sources(&self) -> Result<Vec<Source>, DatabaseError>;

    async fn upsert_source_last_updated(
        &self,
        source_id: i64,
        timestamp: i64,
    ) -> Result<(), DatabaseError>;

    /// Returns `false` when a uniqueness constraint already held the item.
    async fn insert_content_if_absent(&self, item: &NewContent) -> Result<bool, DatabaseError>;

    async fn find_by_fingerprint(
        &self,
        source_id: i64,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ContentItem>, DatabaseError>;

    /// Returns the new consecutive failure count.
    async fn record_source_failure(&self, source_id: i64, error: &str)
        -> Result<i64, DatabaseError>;

    async fn reset_source_failures(&self, source_id: i64) -> Result<(), DatabaseError>;
}

#[async_trait]
impl ContentStore for Database {
    async fn get_active_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        self.active_sources().await
    }

    async fn upsert_source_last_updated(
        &self,
        source_id: i64,
        timestamp: i64,
    ) -> Result<(), DatabaseError> {
        self.set_source_last_updated(source_id, timestamp).await
    }

    async fn insert_content_if_absent(&self, item: &NewContent) -> Result<bool, DatabaseError> {
        self.insert_content(item).await
    }

    async fn find_by_fingerprint(
        &self,
        source_id: i64,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ContentItem>, DatabaseError> {
        self.content_by_fingerprint(source_id, fingerprint).await
    }

    async fn record_source_failure(
        &self,
        source_id: i64,
        error: &str,
    ) -> Result<i64, DatabaseError> {
        self.increment_source_failures(source_id, error).await
    }

    async fn reset_source_failures(&self, source_id: i64) -> Result<(), DatabaseError> {
        Database::reset_source_failures(self, source_id).await
    }
}
