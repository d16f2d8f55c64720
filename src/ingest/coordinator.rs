use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::report::{RunReport, SharedFeedUrl, SkipReason, SourceOutcome, SourceStatus};
use crate::dedup::{fingerprint_batch, normalize_url, DedupOutcome, Deduplicator, Fingerprint};
use crate::feed::paywall::{detect_paywall, looks_restricted};
use crate::feed::{
    parse_feed, CandidateItem, FeedFormat, FetchError, FetchStatus, Fetcher, ParseError,
};
use crate::storage::{ContentStore, Database, DatabaseError, NewContent, Source};
use crate::util::validate_source_url;

/// Default number of sources processed at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;
/// Default wall-clock budget for one run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);
/// Deadline used when the configured budget overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Errors raised while processing one source. Contained by the coordinator.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Parse(ParseError),
    #[error("Storage failure: {0}")]
    Persistence(#[from] DatabaseError),
    #[error("Run deadline exceeded")]
    DeadlineExceeded,
}

impl IngestError {
    fn fetch_status(&self) -> Option<FetchStatus> {
        match self {
            IngestError::Fetch(e) => Some(e.status()),
            IngestError::Parse(_) | IngestError::Persistence(_) => Some(FetchStatus::Ok),
            IngestError::DeadlineExceeded => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Bounded worker pool size (1..=32)
    pub max_concurrent: usize,
    pub run_timeout: Duration,
    /// Fetch each new article page to look for paywall markers
    pub detect_paywalls: bool,
    /// Let article fetches reach loopback and private-network hosts
    pub allow_private_hosts: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            detect_paywalls: false,
            allow_private_hosts: false,
        }
    }
}

/// Per-source processing state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Idle,
    Fetching,
    Parsing,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceState::Idle => "idle",
            SourceState::Fetching => "fetching",
            SourceState::Parsing => "parsing",
            SourceState::Persisting => "persisting",
            SourceState::Done => "done",
            SourceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn transition(source: &Source, state: SourceState) {
    tracing::debug!(source_id = source.id, name = %source.name, state = %state, "Source state");
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Ids of sources currently being processed.
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<i64>>>);

/// Releases the source id when dropped, including on cancellation.
struct InFlightGuard {
    set: InFlight,
    source_id: i64,
}

impl InFlight {
    fn try_claim(&self, source_id: i64) -> Option<InFlightGuard> {
        let mut ids = self.0.lock().unwrap_or_else(|e| e.into_inner());
        ids.insert(source_id).then(|| InFlightGuard {
            set: self.clone(),
            source_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.set.0.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.source_id);
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Default)]
struct SourceCounts {
    inserted: usize,
    duplicates: usize,
    skipped_entries: usize,
    paywalled: usize,
}

/// Runs fetch, parse, dedupe and persist across all due sources.
pub struct Coordinator<S: ContentStore + ?Sized> {
    store: Arc<S>,
    fetcher: Fetcher,
    options: IngestOptions,
    in_flight: InFlight,
}

impl<S: ContentStore + ?Sized> Coordinator<S> {
    pub fn new(store: Arc<S>, fetcher: Fetcher, options: IngestOptions) -> Self {
        Self {
            store,
            fetcher,
            options,
            in_flight: InFlight::default(),
        }
    }

    /// Run once against the current time.
    pub async fn run(&self) -> Result<RunReport, IngestError> {
        self.run_at(chrono::Utc::now().timestamp()).await
    }

    /// Run once, treating `started_at` (unix seconds) as the current time.
    ///
    /// Only loading the source list can fail the run; every per-source error
    /// is recorded in the report.
    pub async fn run_at(&self, started_at: i64) -> Result<RunReport, IngestError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.options.run_timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let sources = self.store.get_active_sources().await?;
        let shared_feed_urls = find_shared_feed_urls(&sources);

        for shared in &shared_feed_urls {
            tracing::warn!(
                url = %shared.url,
                sources = %shared.sources.join(", "),
                "Feed URL configured on several sources; each is fetched separately"
            );
        }

        let active = sources.len();
        let (due, not_due): (Vec<Source>, Vec<Source>) =
            sources.into_iter().partition(|s| s.is_due(started_at));

        let mut outcomes = Vec::with_capacity(due.len());
        let mut runnable = Vec::with_capacity(due.len());
        for source in due {
            if source.consecutive_failures >= Database::CIRCUIT_BREAKER_THRESHOLD {
                outcomes.push(SourceOutcome::skipped(
                    source.id,
                    &source.name,
                    SkipReason::CircuitOpen,
                ));
            } else {
                runnable.push(source);
            }
        }

        if !outcomes.is_empty() {
            tracing::info!(
                skipped = outcomes.len(),
                threshold = Database::CIRCUIT_BREAKER_THRESHOLD,
                "Skipping sources due to consecutive failures (use `sources reset` to retry)"
            );
        }

        tracing::info!(
            active,
            due = runnable.len(),
            not_due = not_due.len(),
            max_concurrent = self.options.max_concurrent,
            "Starting ingestion run"
        );

        let processed: Vec<SourceOutcome> = stream::iter(runnable)
            .map(|source| self.run_source(source, deadline))
            .buffer_unordered(self.options.max_concurrent.max(1))
            .collect()
            .await;

        for outcome in &processed {
            if outcome.status == SourceStatus::Done {
                if let Err(e) = self
                    .store
                    .upsert_source_last_updated(outcome.source_id, started_at)
                    .await
                {
                    tracing::warn!(
                        source_id = outcome.source_id,
                        error = %e,
                        "Failed to update last_updated"
                    );
                }
            }
        }

        outcomes.extend(processed);
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));

        let report = RunReport {
            started_at,
            finished_at: chrono::Utc::now().timestamp(),
            not_due: not_due.len(),
            outcomes,
            shared_feed_urls,
        };

        tracing::info!(
            inserted = report.total_inserted(),
            completed = report.completed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Ingestion run finished"
        );

        Ok(report)
    }

    async fn run_source(&self, source: Source, deadline: Instant) -> SourceOutcome {
        if Instant::now() >= deadline {
            return SourceOutcome::skipped(source.id, &source.name, SkipReason::DeadlineExceeded);
        }

        let Some(_guard) = self.in_flight.try_claim(source.id) else {
            tracing::debug!(source_id = source.id, "Source already in flight, skipping");
            return SourceOutcome::skipped(source.id, &source.name, SkipReason::InFlight);
        };

        transition(&source, SourceState::Idle);
        let result = tokio::time::timeout_at(deadline, self.process_source(&source))
            .await
            .unwrap_or(Err(IngestError::DeadlineExceeded));

        match result {
            Ok(counts) => {
                transition(&source, SourceState::Done);
                if source.consecutive_failures > 0 {
                    if let Err(e) = self.store.reset_source_failures(source.id).await {
                        tracing::warn!(source_id = source.id, error = %e, "Failed to reset failure count");
                    }
                }
                tracing::info!(
                    source_id = source.id,
                    name = %source.name,
                    inserted = counts.inserted,
                    duplicates = counts.duplicates,
                    "Source ingested"
                );
                SourceOutcome {
                    source_id: source.id,
                    name: source.name,
                    status: SourceStatus::Done,
                    fetch_status: Some(FetchStatus::Ok),
                    inserted: counts.inserted,
                    duplicates: counts.duplicates,
                    skipped_entries: counts.skipped_entries,
                    paywalled: counts.paywalled,
                }
            }
            Err(e) => {
                transition(&source, SourceState::Failed);
                tracing::warn!(source_id = source.id, name = %source.name, error = %e, "Source failed");
                self.record_failure(&source, &e).await;
                SourceOutcome {
                    source_id: source.id,
                    name: source.name,
                    status: SourceStatus::Failed {
                        error: e.to_string(),
                    },
                    fetch_status: e.fetch_status(),
                    inserted: 0,
                    duplicates: 0,
                    skipped_entries: 0,
                    paywalled: 0,
                }
            }
        }
    }

    async fn record_failure(&self, source: &Source, error: &IngestError) {
        match self
            .store
            .record_source_failure(source.id, &error.to_string())
            .await
        {
            Ok(failures) if failures >= Database::CIRCUIT_BREAKER_THRESHOLD => {
                tracing::info!(
                    source_id = source.id,
                    name = %source.name,
                    failures,
                    "Source circuit breaker tripped - will be skipped until reset"
                );
            }
            Ok(_) => {}
            Err(db_err) => {
                tracing::warn!(
                    source_id = source.id,
                    error = %db_err,
                    "Failed to increment source failure count"
                );
            }
        }
    }

    async fn process_source(&self, source: &Source) -> Result<SourceCounts, IngestError> {
        transition(source, SourceState::Fetching);
        let body = self.fetcher.fetch(&source.url).await?;

        transition(source, SourceState::Parsing);
        let (candidates, skipped_entries) = {
            let format = FeedFormat::for_source_type(source.source_type);
            let parsed = parse_feed(&body.bytes, format, Some(&body.final_url));
            if let Some(err) = parsed.error() {
                return Err(IngestError::Parse(err.clone()));
            }
            let mut items = parsed.items();
            let candidates: Vec<CandidateItem> = items.by_ref().collect();
            (candidates, items.skipped())
        };

        if skipped_entries > 0 {
            tracing::warn!(
                source_id = source.id,
                skipped = skipped_entries,
                "Entries without title or link skipped"
            );
        }

        transition(source, SourceState::Persisting);
        let mut counts = SourceCounts {
            skipped_entries,
            ..SourceCounts::default()
        };
        let fingerprints = fingerprint_batch(&candidates);

        for (candidate, fingerprint) in candidates.into_iter().zip(fingerprints) {
            if Deduplicator::check(self.store.as_ref(), source.id, &fingerprint).await?
                == DedupOutcome::Duplicate
            {
                counts.duplicates += 1;
                continue;
            }

            let is_paywalled = self.is_paywalled(&candidate).await;
            let item = new_content(source.id, candidate, fingerprint, is_paywalled);

            if self.store.insert_content_if_absent(&item).await? {
                counts.inserted += 1;
                if is_paywalled {
                    counts.paywalled += 1;
                }
            } else {
                counts.duplicates += 1;
            }
        }

        Ok(counts)
    }

    async fn is_paywalled(&self, candidate: &CandidateItem) -> bool {
        let link = candidate.link.as_deref();
        if looks_restricted(link, &candidate.title, candidate.description.as_deref()) {
            return true;
        }
        let (true, Some(link)) = (self.options.detect_paywalls, link) else {
            return false;
        };
        // Links come from the feed; hold them to the same host policy as sources
        if let Err(e) = validate_source_url(link, self.options.allow_private_hosts) {
            tracing::debug!(url = %link, error = %e, "Article link rejected, skipping paywall check");
            return false;
        }

        match self.fetcher.fetch(link).await {
            Ok(page) => detect_paywall(&String::from_utf8_lossy(&page.bytes)),
            Err(e) => {
                tracing::debug!(url = %link, error = %e, "Article fetch for paywall check failed");
                false
            }
        }
    }
}

fn new_content(
    source_id: i64,
    candidate: CandidateItem,
    fingerprint: Fingerprint,
    is_paywalled: bool,
) -> NewContent {
    // Untitled entries are stored under their link
    let title = if candidate.title.is_empty() {
        candidate.link.clone().unwrap_or_default()
    } else {
        candidate.title
    };

    // A link shared within the batch (every episode pointing at the show
    // page) cannot identify the item; the enclosure can, otherwise the
    // fingerprint constraint alone arbitrates.
    let content_url = match fingerprint {
        Fingerprint::Url(_) => candidate.link,
        Fingerprint::TitleDate(_) => candidate.enclosure_url.clone(),
    };

    NewContent {
        source_id,
        title,
        description: candidate.description,
        content_url,
        author: candidate.author,
        published_at: candidate.published_at,
        metrics: candidate.metrics,
        enclosure_url: candidate.enclosure_url,
        is_paywalled,
        fingerprint,
    }
}

/// Active sources that point at the same feed, by normalized URL.
fn find_shared_feed_urls(sources: &[Source]) -> Vec<SharedFeedUrl> {
    let mut by_url: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for source in sources {
        by_url
            .entry(normalize_url(&source.url))
            .or_default()
            .push(source.name.clone());
    }

    by_url
        .into_iter()
        .filter(|(_, names)| names.len() > 1)
        .map(|(url, sources)| SharedFeedUrl { url, sources })
        .collect()
}
