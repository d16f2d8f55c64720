use serde::Serialize;
use std::fmt;

use crate::feed::FetchStatus;

/// Why a due source was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Consecutive failures reached the circuit breaker threshold
    CircuitOpen,
    /// The run deadline passed before the source was started
    DeadlineExceeded,
    /// Another run is already fetching this source
    InFlight,
}

/// Final state of a source within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Done,
    Failed { error: String },
    Skipped { reason: SkipReason },
}

/// Per-source line of a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: i64,
    pub name: String,
    #[serde(flatten)]
    pub status: SourceStatus,
    /// `None` when the source was never fetched
    pub fetch_status: Option<FetchStatus>,
    pub inserted: usize,
    pub duplicates: usize,
    /// Feed entries dropped for having neither title nor link
    pub skipped_entries: usize,
    pub paywalled: usize,
}

impl SourceOutcome {
    pub fn skipped(source_id: i64, name: &str, reason: SkipReason) -> Self {
        Self {
            source_id,
            name: name.to_owned(),
            status: SourceStatus::Skipped { reason },
            fetch_status: None,
            inserted: 0,
            duplicates: 0,
            skipped_entries: 0,
            paywalled: 0,
        }
    }
}

/// A feed URL configured on more than one active source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedFeedUrl {
    pub url: String,
    pub sources: Vec<String>,
}

/// Result of one ingestion run. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Unix seconds; written to `last_updated` of completed sources
    pub started_at: i64,
    pub finished_at: i64,
    /// Active sources whose interval had not yet elapsed
    pub not_due: usize,
    pub outcomes: Vec<SourceOutcome>,
    pub shared_feed_urls: Vec<SharedFeedUrl>,
}

impl RunReport {
    pub fn total_inserted(&self) -> usize {
        self.outcomes.iter().map(|o| o.inserted).sum()
    }

    pub fn count(&self, pred: impl Fn(&SourceStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Done))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, SourceStatus::Skipped { .. }))
    }

    /// Every source that was attempted failed.
    pub fn is_total_failure(&self) -> bool {
        self.failed() > 0 && self.completed() == 0
    }

    pub fn outcome(&self, name: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            match &o.status {
                SourceStatus::Done => writeln!(
                    f,
                    "  ok      {:<32} +{} new, {} duplicate, {} skipped{}",
                    o.name,
                    o.inserted,
                    o.duplicates,
                    o.skipped_entries,
                    if o.paywalled > 0 {
                        format!(", {} paywalled", o.paywalled)
                    } else {
                        String::new()
                    }
                )?,
                SourceStatus::Failed { error } => {
                    writeln!(f, "  FAILED  {:<32} {}", o.name, error)?
                }
                SourceStatus::Skipped { reason } => {
                    let reason = match reason {
                        SkipReason::CircuitOpen => "too many consecutive failures",
                        SkipReason::DeadlineExceeded => "run deadline reached",
                        SkipReason::InFlight => "already being fetched",
                    };
                    writeln!(f, "  skipped {:<32} {}", o.name, reason)?
                }
            }
        }

        for shared in &self.shared_feed_urls {
            writeln!(
                f,
                "  warning: {} is configured on {}",
                shared.url,
                shared.sources.join(", ")
            )?;
        }

        write!(
            f,
            "{} new items from {} sources ({} failed, {} skipped, {} not due)",
            self.total_inserted(),
            self.completed(),
            self.failed(),
            self.skipped(),
            self.not_due
        )
    }
}
