//! Content identity and duplicate detection.
//!
//! An item is identified by its normalized URL when it has one that is unique
//! within its batch, otherwise by a SHA-256 of its normalized title and
//! publish time. The store's unique constraints remain the final arbiter.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::feed::CandidateItem;
use crate::storage::{ContentStore, DatabaseError};
use crate::util::collapse_whitespace;

/// Normalized identity key for a content item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Normalized content URL
    Url(String),
    /// Hex SHA-256 of `normalized title|published_at`
    TitleDate(String),
}

impl Fingerprint {
    pub fn from_url(url: &str) -> Self {
        Fingerprint::Url(normalize_url(url))
    }

    pub fn from_title_date(title: &str, published_at: Option<i64>) -> Self {
        let title = collapse_whitespace(title).to_lowercase();
        let input = format!(
            "{}|{}",
            title,
            published_at.map(|p| p.to_string()).unwrap_or_default()
        );
        Fingerprint::TitleDate(format!("{:x}", Sha256::digest(input.as_bytes())))
    }

    /// The string stored in the `fingerprint` column.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Url(url) => write!(f, "url:{url}"),
            Fingerprint::TitleDate(hash) => write!(f, "sha256:{hash}"),
        }
    }
}

/// Trim, lowercase, drop the fragment and any trailing slashes.
///
/// ```
/// use media_monitor::dedup::normalize_url;
///
/// assert_eq!(normalize_url("  HTTPS://Example.com/Post/#comments "), "https://example.com/post");
/// ```
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let without_fragment = url.split_once('#').map_or(url, |(head, _)| head);
    without_fragment
        .trim_end_matches('/')
        .to_lowercase()
}

/// Fingerprint each candidate of one feed body.
///
/// A candidate's URL is used only when no other candidate in the batch
/// normalizes to the same URL; shared URLs (e.g. a feed linking every
/// episode to the show page) fall back to title/date. Such items must not be
/// stored under the shared link, or the content URL constraint folds them
/// into one row.
pub fn fingerprint_batch(candidates: &[CandidateItem]) -> Vec<Fingerprint> {
    let mut url_counts: HashMap<String, usize> = HashMap::new();
    for link in candidates.iter().filter_map(|c| c.link.as_deref()) {
        let normalized = normalize_url(link);
        if !normalized.is_empty() {
            *url_counts.entry(normalized).or_default() += 1;
        }
    }

    candidates
        .iter()
        .map(|candidate| {
            candidate
                .link
                .as_deref()
                .map(normalize_url)
                .filter(|url| url_counts.get(url) == Some(&1))
                .map(Fingerprint::Url)
                .unwrap_or_else(|| {
                    Fingerprint::from_title_date(&candidate.title, candidate.published_at)
                })
        })
        .collect()
}

/// Whether an item has been seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

pub struct Deduplicator;

impl Deduplicator {
    /// Look the fingerprint up among the items already stored for `source_id`.
    ///
    /// A URL fingerprint only matches URL fingerprints, so a URL match wins
    /// over title/date: a retitled article at the same URL is a duplicate,
    /// and two different URLs sharing a title are both new.
    pub async fn check<S: ContentStore + ?Sized>(
        store: &S,
        source_id: i64,
        fingerprint: &Fingerprint,
    ) -> Result<DedupOutcome, DatabaseError> {
        let existing = store.find_by_fingerprint(source_id, fingerprint).await?;
        Ok(match existing {
            Some(_) => DedupOutcome::Duplicate,
            None => DedupOutcome::New,
        })
    }
}
