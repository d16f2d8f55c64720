//! Feed retrieval and parsing.
//!
//! - [`fetcher`] - HTTP GET with per-attempt timeout, size cap and retry
//! - [`parser`] - RSS/Atom/podcast bodies into [`CandidateItem`]s via `feed-rs`
//! - [`html`] - fallback extraction from blog index pages
//! - [`paywall`] - heuristics for subscriber-only content
//!
//! # Example
//!
//! ```ignore
//! let fetcher = Fetcher::new("media-monitor/0.1", FetchPolicy::default())?;
//! let body = fetcher.fetch(&source.url).await?;
//! let parsed = parse_feed(&body.bytes, FeedFormat::for_source_type(source.source_type), Some(&body.final_url));
//! for item in parsed.items() { /* ... */ }
//! ```

mod fetcher;
mod html;
mod parser;
pub mod paywall;

pub use fetcher::{
    FetchError, FetchPolicy, FetchStatus, FetchedBody, Fetcher, DEFAULT_BACKOFF_BASE,
    DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT,
};
pub use html::{extract_html_items, MAX_HTML_ITEMS};
pub use parser::{parse_feed, CandidateItem, Candidates, FeedFormat, ParseError, ParsedFeed};
