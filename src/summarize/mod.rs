//! Summarization of stored content by a language model.
//!
//! [`Summarizer`] is the model seam; [`RemoteSummarizer`] talks to an
//! OpenAI-compatible chat completions endpoint. [`SummaryService`] loads the
//! requested items, drops restricted ones, builds the prompt and stores the
//! result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod remote;
mod service;

pub use remote::{RemoteSummarizer, DEFAULT_API_URL, DEFAULT_MODEL};
pub use service::{AnalysisPreset, SummaryService, SYSTEM_PROMPT};

/// Typed failures of a summarization request. Always surfaced to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SummarizationError {
    #[error("Summarization quota exceeded")]
    QuotaExceeded,
    #[error("Invalid summarization request: {0}")]
    InvalidRequest(String),
    #[error("Summarization service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Could not load or store summary data: {0}")]
    Storage(String),
}

impl From<crate::storage::DatabaseError> for SummarizationError {
    fn from(e: crate::storage::DatabaseError) -> Self {
        SummarizationError::Storage(e.to_string())
    }
}

/// What the caller asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub content_ids: Vec<i64>,
    pub prompt: String,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryResponse {
    pub summary_id: i64,
    pub summary_text: String,
    pub model_used: String,
    pub tokens_used: Option<i64>,
    /// Unix seconds
    pub created_at: i64,
    /// Items left out because they looked paywalled
    pub excluded: usize,
}

/// A single completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    pub tokens_used: Option<i64>,
}

/// A language model that turns a prompt into text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, SummarizationError>;
}
