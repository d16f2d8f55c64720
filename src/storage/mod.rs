mod content;
mod schema;
mod sources;
mod store;
mod summaries;
mod types;

pub use schema::Database;
pub use store::ContentStore;
pub use types::{
    ContentItem, DatabaseError, Metrics, NewContent, NewSource, NewSummary, Source,
    SourceMetadata, SourceType, Summary, DEFAULT_UPDATE_INTERVAL,
};
