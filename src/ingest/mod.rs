//! Ingestion runs: every due source fetched, parsed, deduplicated and stored
//! by a bounded worker pool, with failures contained per source.

mod coordinator;
mod report;

pub use coordinator::{
    Coordinator, IngestError, IngestOptions, DEFAULT_MAX_CONCURRENT, DEFAULT_RUN_TIMEOUT,
};
pub use report::{RunReport, SharedFeedUrl, SkipReason, SourceOutcome, SourceStatus};
