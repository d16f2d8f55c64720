//! Media monitoring: periodic ingestion of RSS, Atom and podcast feeds into
//! SQLite, and LLM summaries over the stored content.

pub mod config;
pub mod dedup;
pub mod feed;
pub mod ingest;
pub mod storage;
pub mod summarize;
pub mod util;
