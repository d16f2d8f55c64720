use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::Fingerprint;

/// Default refresh interval for a source, in seconds.
pub const DEFAULT_UPDATE_INTERVAL: i64 = 3600;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has the database locked
    #[error("Another media-monitor process appears to hold the database lock. Wait for it to finish and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A record was rejected before reaching SQLite
    #[error("Invalid record: {0}")]
    Validation(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Source Types
// ============================================================================

/// Kind of feed a source publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Blog,
    Podcast,
    Twitter,
    Reddit,
    Media,
    Creator,
    BusinessModels,
}

impl SourceType {
    pub const ALL: [SourceType; 7] = [
        SourceType::Blog,
        SourceType::Podcast,
        SourceType::Twitter,
        SourceType::Reddit,
        SourceType::Media,
        SourceType::Creator,
        SourceType::BusinessModels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Blog => "blog",
            SourceType::Podcast => "podcast",
            SourceType::Twitter => "twitter",
            SourceType::Reddit => "reddit",
            SourceType::Media => "media",
            SourceType::Creator => "creator",
            SourceType::BusinessModels => "business_models",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DatabaseError::Validation(format!("unknown source type '{s}'")))
    }
}

/// Per-type source metadata, stored as JSON tagged by `kind`.
///
/// The variant must agree with the owning source's [`SourceType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceMetadata {
    Blog {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
    },
    Podcast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default)]
        has_audio_enclosure: bool,
    },
    Twitter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<String>,
    },
    Reddit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subreddit: Option<String>,
    },
    Media {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    Creator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
    BusinessModels {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
}

impl SourceMetadata {
    /// Empty metadata for a source type.
    pub fn default_for(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Blog => SourceMetadata::Blog {
                category: None,
                priority: None,
            },
            SourceType::Podcast => SourceMetadata::Podcast {
                category: None,
                has_audio_enclosure: true,
            },
            SourceType::Twitter => SourceMetadata::Twitter { handle: None },
            SourceType::Reddit => SourceMetadata::Reddit { subreddit: None },
            SourceType::Media => SourceMetadata::Media { category: None },
            SourceType::Creator => SourceMetadata::Creator { platform: None },
            SourceType::BusinessModels => SourceMetadata::BusinessModels { category: None },
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            SourceMetadata::Blog { .. } => SourceType::Blog,
            SourceMetadata::Podcast { .. } => SourceType::Podcast,
            SourceMetadata::Twitter { .. } => SourceType::Twitter,
            SourceMetadata::Reddit { .. } => SourceType::Reddit,
            SourceMetadata::Media { .. } => SourceType::Media,
            SourceMetadata::Creator { .. } => SourceType::Creator,
            SourceMetadata::BusinessModels { .. } => SourceType::BusinessModels,
        }
    }

    pub(crate) fn to_json(&self) -> Result<String, DatabaseError> {
        serde_json::to_string(self)
            .map_err(|e| DatabaseError::Validation(format!("metadata not serializable: {e}")))
    }
}

/// A configured feed endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub source_type: SourceType,
    pub description: Option<String>,
    pub is_active: bool,
    /// Unix seconds of the last completed ingestion, `None` if never fetched.
    pub last_updated: Option<i64>,
    pub update_interval: i64,
    pub metadata: SourceMetadata,
    /// Number of consecutive failed runs (circuit breaker)
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
}

impl Source {
    /// Whether the refresh interval has elapsed at `now` (unix seconds).
    ///
    /// A source that was never fetched is always due.
    pub fn is_due(&self, now: i64) -> bool {
        match self.last_updated {
            None => true,
            Some(last) => now >= last.saturating_add(self.update_interval),
        }
    }
}

/// Input for creating or syncing a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_update_interval")]
    pub update_interval: i64,
    #[serde(default)]
    pub metadata: Option<SourceMetadata>,
}

fn default_update_interval() -> i64 {
    DEFAULT_UPDATE_INTERVAL
}

impl NewSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            source_type,
            description: None,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            metadata: None,
        }
    }

    /// Checks field invariants and resolves the metadata to store.
    pub fn validate(&self) -> Result<SourceMetadata, DatabaseError> {
        if self.name.trim().is_empty() {
            return Err(DatabaseError::Validation("source name is empty".into()));
        }
        if self.url.trim().is_empty() {
            return Err(DatabaseError::Validation(format!(
                "source '{}' has no url",
                self.name
            )));
        }
        if self.update_interval <= 0 {
            return Err(DatabaseError::Validation(format!(
                "source '{}' has update_interval {} (must be > 0)",
                self.name, self.update_interval
            )));
        }

        match &self.metadata {
            None => Ok(SourceMetadata::default_for(self.source_type)),
            Some(meta) if meta.source_type() == self.source_type => Ok(meta.clone()),
            Some(meta) => Err(DatabaseError::Validation(format!(
                "source '{}' is {} but metadata kind is {}",
                self.name,
                self.source_type,
                meta.source_type()
            ))),
        }
    }
}

/// Row type for source queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub source_type: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub last_updated: Option<i64>,
    pub update_interval: i64,
    pub metadata: String,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
}

impl SourceRow {
    pub(crate) fn into_source(self) -> Result<Source, DatabaseError> {
        let source_type: SourceType = self.source_type.parse()?;
        let metadata = match serde_json::from_str::<SourceMetadata>(&self.metadata) {
            Ok(meta) if meta.source_type() == source_type => meta,
            _ => {
                tracing::warn!(
                    source_id = self.id,
                    "Unreadable source metadata, using defaults"
                );
                SourceMetadata::default_for(source_type)
            }
        };

        Ok(Source {
            id: self.id,
            name: self.name,
            url: self.url,
            source_type,
            description: self.description,
            is_active: self.is_active,
            last_updated: self.last_updated,
            update_interval: self.update_interval,
            metadata,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error,
        })
    }
}

// ============================================================================
// Content Types
// ============================================================================

/// Engagement figures attached to a content item (e.g. `duration_secs`).
pub type Metrics = BTreeMap<String, i64>;

/// A content item ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContent {
    pub source_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub content_url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub metrics: Metrics,
    pub enclosure_url: Option<String>,
    pub is_paywalled: bool,
    pub fingerprint: Fingerprint,
}

/// A stored content item.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub content_url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub metrics: Metrics,
    pub enclosure_url: Option<String>,
    pub is_paywalled: bool,
    pub fingerprint: String,
    pub created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ContentRow {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub content_url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub metrics: String,
    pub enclosure_url: Option<String>,
    pub is_paywalled: bool,
    pub fingerprint: String,
    pub created_at: i64,
}

impl ContentRow {
    pub(crate) fn into_item(self) -> ContentItem {
        let metrics = serde_json::from_str(&self.metrics).unwrap_or_default();
        ContentItem {
            id: self.id,
            source_id: self.source_id,
            title: self.title,
            description: self.description,
            content_url: self.content_url,
            author: self.author,
            published_at: self.published_at,
            metrics,
            enclosure_url: self.enclosure_url,
            is_paywalled: self.is_paywalled,
            fingerprint: self.fingerprint,
            created_at: self.created_at,
        }
    }
}

// ============================================================================
// Summary Types
// ============================================================================

/// A summary produced by the language model, as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub id: i64,
    pub content_ids: Vec<i64>,
    pub prompt: String,
    pub summary_text: String,
    pub model_used: String,
    pub tokens_used: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewSummary {
    pub content_ids: Vec<i64>,
    pub prompt: String,
    pub summary_text: String,
    pub model_used: String,
    pub tokens_used: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SummaryRow {
    pub id: i64,
    pub content_ids: String,
    pub prompt: String,
    pub summary_text: String,
    pub model_used: String,
    pub tokens_used: Option<i64>,
    pub created_at: i64,
}

impl SummaryRow {
    pub(crate) fn into_summary(self) -> Summary {
        Summary {
            id: self.id,
            content_ids: serde_json::from_str(&self.content_ids).unwrap_or_default(),
            prompt: self.prompt,
            summary_text: self.summary_text,
            model_used: self.model_used,
            tokens_used: self.tokens_used,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_source_type_round_trips_through_str() {
        for t in SourceType::ALL {
            assert_eq!(t.as_str().parse::<SourceType>().unwrap(), t);
        }
        assert!("newsletter".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_metadata_json_is_tagged_by_kind() {
        let meta = SourceMetadata::Podcast {
            category: Some("tech".into()),
            has_audio_enclosure: true,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"podcast","category":"tech","has_audio_enclosure":true}"#
        );

        let parsed: SourceMetadata = serde_json::from_str(r#"{"kind":"reddit"}"#).unwrap();
        assert_eq!(parsed, SourceMetadata::Reddit { subreddit: None });
    }

    #[test]
    fn test_validate_rejects_mismatched_metadata() {
        let mut source = NewSource::new("Stratechery", "https://stratechery.com/feed/", SourceType::Blog);
        source.metadata = Some(SourceMetadata::Twitter { handle: None });

        assert!(matches!(source.validate(), Err(DatabaseError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_non_positive_interval() {
        let mut source = NewSource::new("a16z", "https://a16z.com/feed/", SourceType::Blog);
        source.update_interval = 0;
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_validate_fills_default_metadata() {
        let source = NewSource::new("Acquired", "https://acquired.fm/rss", SourceType::Podcast);
        assert_eq!(
            source.validate().unwrap(),
            SourceMetadata::default_for(SourceType::Podcast)
        );
    }

    #[test]
    fn test_is_due() {
        let now = 1_700_000_000;
        let mut source = Source {
            id: 1,
            name: "A".into(),
            url: "https://a.example.com/feed".into(),
            source_type: SourceType::Blog,
            description: None,
            is_active: true,
            last_updated: None,
            update_interval: 3600,
            metadata: SourceMetadata::default_for(SourceType::Blog),
            consecutive_failures: 0,
            last_error: None,
        };
        assert!(source.is_due(now));

        source.last_updated = Some(now - 4000);
        assert!(source.is_due(now));

        source.last_updated = Some(now - 100);
        assert!(!source.is_due(now));
    }
}
