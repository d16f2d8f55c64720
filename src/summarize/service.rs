use std::fmt::Write as _;
use std::sync::Arc;

use crate::feed::paywall::looks_restricted;
use crate::storage::{ContentItem, Database, NewSummary};
use crate::util::truncate_chars;

use super::{ModelRequest, SummarizationError, Summarizer, SummaryRequest, SummaryResponse};

pub const SYSTEM_PROMPT: &str = "You are an expert media analyst and business strategist. \
Provide insightful, well-structured summaries based on the given content and prompt.";

const DEFAULT_MAX_TOKENS: u32 = 1000;
/// Per-item cap on text sent to the model.
const MAX_ITEM_CHARS: usize = 2000;

/// Canned analysis prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AnalysisPreset {
    BusinessModels,
    CreatorEconomy,
    VcTrends,
}

impl AnalysisPreset {
    pub fn prompt(self) -> &'static str {
        match self {
            AnalysisPreset::BusinessModels => {
                "Analyze the following content to identify and explain media business models. Focus on:\n\
                 1. Traditional media business models (advertising, subscriptions, etc.)\n\
                 2. Non-traditional media businesses that don't look like media but are highly profitable\n\
                 3. Distribution strategies and revenue streams\n\
                 4. Creator economy monetization methods\n\
                 5. Emerging business models in digital media\n\n\
                 Provide specific examples and insights from the content."
            }
            AnalysisPreset::CreatorEconomy => {
                "Analyze the following content to understand creator economy trends and business models. Focus on:\n\
                 1. How creators monetize their content\n\
                 2. Platform strategies and revenue sharing\n\
                 3. Emerging creator tools and services\n\
                 4. Investment trends in creator economy\n\
                 5. Challenges and opportunities for creators\n\n\
                 Provide actionable insights and trend analysis."
            }
            AnalysisPreset::VcTrends => {
                "Analyze the following content to understand VC investment trends in media and creator economy. Focus on:\n\
                 1. Investment themes and sectors\n\
                 2. Notable deals and valuations\n\
                 3. Emerging business models attracting investment\n\
                 4. Market trends and predictions\n\
                 5. Strategic insights for entrepreneurs and investors\n\n\
                 Provide data-driven analysis and strategic recommendations."
            }
        }
    }
}

/// Loads content, filters restricted items, calls the model and records the
/// summary.
pub struct SummaryService {
    db: Database,
    summarizer: Arc<dyn Summarizer>,
    max_tokens: u32,
}

impl SummaryService {
    pub fn new(db: Database, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            db,
            summarizer,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub async fn summarize(
        &self,
        request: &SummaryRequest,
    ) -> Result<SummaryResponse, SummarizationError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(SummarizationError::InvalidRequest("prompt is empty".into()));
        }
        if request.content_ids.is_empty() {
            return Err(SummarizationError::InvalidRequest(
                "no content ids given".into(),
            ));
        }

        let items = self.db.content_by_ids(&request.content_ids).await?;
        if items.is_empty() {
            return Err(SummarizationError::InvalidRequest(
                "no content found for the provided ids".into(),
            ));
        }
        if items.len() < request.content_ids.len() {
            tracing::warn!(
                requested = request.content_ids.len(),
                found = items.len(),
                "Some content ids were not found"
            );
        }

        let (allowed, restricted): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|item| !is_restricted(item));
        if allowed.is_empty() {
            return Err(SummarizationError::InvalidRequest(format!(
                "all {} selected items are premium/restricted and cannot be analyzed",
                restricted.len()
            )));
        }

        let model_request = ModelRequest {
            system: SYSTEM_PROMPT.to_owned(),
            user: build_prompt(prompt, &allowed),
            max_tokens: self.max_tokens,
        };

        tracing::info!(
            items = allowed.len(),
            excluded = restricted.len(),
            "Requesting summary"
        );
        let completion = self.summarizer.complete(&model_request).await?;

        let mut summary_text = completion.text;
        if !restricted.is_empty() {
            summary_text = format!(
                "*Note: {} premium/restricted articles were excluded from this analysis.*\n\n{}",
                restricted.len(),
                summary_text
            );
        }

        let stored = self
            .db
            .insert_summary(&NewSummary {
                content_ids: allowed.iter().map(|item| item.id).collect(),
                prompt: prompt.to_owned(),
                summary_text,
                model_used: completion.model,
                tokens_used: completion.tokens_used,
                created_at: chrono::Utc::now().timestamp(),
            })
            .await?;

        Ok(SummaryResponse {
            summary_id: stored.id,
            summary_text: stored.summary_text,
            model_used: stored.model_used,
            tokens_used: stored.tokens_used,
            created_at: stored.created_at,
            excluded: restricted.len(),
        })
    }
}

fn is_restricted(item: &ContentItem) -> bool {
    item.is_paywalled
        || looks_restricted(
            item.content_url.as_deref(),
            &item.title,
            item.description.as_deref(),
        )
}

fn build_prompt(prompt: &str, items: &[ContentItem]) -> String {
    let mut content = String::new();
    for item in items {
        let _ = writeln!(content, "Title: {}", item.title);
        if let Some(description) = item.description.as_deref().filter(|d| !d.is_empty()) {
            let _ = writeln!(
                content,
                "Description: {}",
                truncate_chars(description, MAX_ITEM_CHARS)
            );
        }
        if let Some(author) = &item.author {
            let _ = writeln!(content, "Author: {}", author);
        }
        if !item.metrics.is_empty() {
            let engagement: Vec<String> = item
                .metrics
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect();
            let _ = writeln!(content, "Engagement: {}", engagement.join(", "));
        }
        content.push_str("---\n");
    }

    format!(
        "{prompt}\n\nContent to analyze:\n{content}\n\
         Please provide a comprehensive summary based on the above prompt and content."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Fingerprint;
    use crate::storage::{NewContent, NewSource, SourceType};
    use crate::summarize::ModelResponse;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSummarizer {
        requests: Mutex<Vec<ModelRequest>>,
        fail_with: Option<SummarizationError>,
    }

    #[async_trait]
    impl Summarizer for RecordingSummarizer {
        async fn complete(
            &self,
            request: &ModelRequest,
        ) -> Result<ModelResponse, SummarizationError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            Ok(ModelResponse {
                text: "Ad revenue is shifting to creators.".into(),
                model: "test-model".into(),
                tokens_used: Some(42),
            })
        }
    }

    async fn seed(db: &Database, items: &[(&str, &str, bool)]) -> Vec<i64> {
        let source_id = db
            .add_source(&NewSource::new(
                "Stratechery",
                "https://stratechery.com/feed/",
                SourceType::Blog,
            ))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for (title, url, paywalled) in items {
            db.insert_content(&NewContent {
                source_id,
                title: (*title).into(),
                description: Some(format!("About {}", title)),
                content_url: Some((*url).into()),
                author: Some("Ben Thompson".into()),
                published_at: Some(1_700_000_000),
                metrics: Default::default(),
                enclosure_url: None,
                is_paywalled: *paywalled,
                fingerprint: Fingerprint::from_url(url),
            })
            .await
            .unwrap();
            let item = db
                .content_by_fingerprint(source_id, &Fingerprint::from_url(url))
                .await
                .unwrap()
                .unwrap();
            ids.push(item.id);
        }
        ids
    }

    fn request(ids: Vec<i64>) -> SummaryRequest {
        SummaryRequest {
            content_ids: ids,
            prompt: "What are the main trends?".into(),
        }
    }

    #[tokio::test]
    async fn test_summarize_stores_summary() {
        let db = Database::open(":memory:").await.unwrap();
        let ids = seed(
            &db,
            &[
                ("Aggregation Theory", "https://stratechery.com/aggregation", false),
                ("The End of the Bundle", "https://stratechery.com/bundle", false),
            ],
        )
        .await;
        let model = Arc::new(RecordingSummarizer::default());
        let service = SummaryService::new(db.clone(), model.clone());

        let response = service.summarize(&request(ids.clone())).await.unwrap();
        assert_eq!(response.summary_text, "Ad revenue is shifting to creators.");
        assert_eq!(response.model_used, "test-model");
        assert_eq!(response.tokens_used, Some(42));
        assert_eq!(response.excluded, 0);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system, SYSTEM_PROMPT);
        assert_eq!(requests[0].max_tokens, 1000);
        assert!(requests[0].user.starts_with("What are the main trends?\n\nContent to analyze:\n"));
        assert!(requests[0].user.contains("Title: Aggregation Theory\n"));
        assert!(requests[0].user.contains("Author: Ben Thompson\n"));

        let stored = db.recent_summaries(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content_ids, ids);
        assert_eq!(stored[0].id, response.summary_id);
    }

    #[tokio::test]
    async fn test_restricted_items_are_excluded_with_note() {
        let db = Database::open(":memory:").await.unwrap();
        let ids = seed(
            &db,
            &[
                ("Free post", "https://stratechery.com/free", false),
                ("Daily Update", "https://stratechery.com/daily", true),
                ("Weekly", "https://stratechery.com/premium/weekly", false),
            ],
        )
        .await;
        let model = Arc::new(RecordingSummarizer::default());
        let service = SummaryService::new(db.clone(), model.clone());

        let response = service.summarize(&request(ids.clone())).await.unwrap();
        assert_eq!(response.excluded, 2);
        assert!(response.summary_text.starts_with(
            "*Note: 2 premium/restricted articles were excluded from this analysis.*\n\n"
        ));

        let user = &model.requests.lock().unwrap()[0].user;
        assert!(user.contains("Free post"));
        assert!(!user.contains("Daily Update"));
        assert!(!user.contains("Weekly"));

        let stored = db.recent_summaries(1).await.unwrap();
        assert_eq!(stored[0].content_ids, vec![ids[0]]);
    }

    #[tokio::test]
    async fn test_all_restricted_is_invalid_request() {
        let db = Database::open(":memory:").await.unwrap();
        let ids = seed(&db, &[("Daily Update", "https://stratechery.com/daily", true)]).await;
        let model = Arc::new(RecordingSummarizer::default());
        let service = SummaryService::new(db.clone(), model.clone());

        let err = service.summarize(&request(ids)).await.unwrap_err();
        assert!(matches!(err, SummarizationError::InvalidRequest(ref m) if m.contains("all 1")));
        assert!(model.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_and_empty_prompt() {
        let db = Database::open(":memory:").await.unwrap();
        let service = SummaryService::new(db, Arc::new(RecordingSummarizer::default()));

        assert!(matches!(
            service.summarize(&request(vec![999])).await,
            Err(SummarizationError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.summarize(&request(vec![])).await,
            Err(SummarizationError::InvalidRequest(_))
        ));
        let blank = SummaryRequest {
            content_ids: vec![1],
            prompt: "   ".into(),
        };
        assert!(matches!(
            service.summarize(&blank).await,
            Err(SummarizationError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_model_errors_propagate_and_nothing_is_stored() {
        let db = Database::open(":memory:").await.unwrap();
        let ids = seed(&db, &[("Free post", "https://stratechery.com/free", false)]).await;
        let model = Arc::new(RecordingSummarizer {
            fail_with: Some(SummarizationError::QuotaExceeded),
            ..Default::default()
        });
        let service = SummaryService::new(db.clone(), model);

        assert_eq!(
            service.summarize(&request(ids)).await.unwrap_err(),
            SummarizationError::QuotaExceeded
        );
        assert!(db.recent_summaries(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_build_prompt_lists_engagement() {
        let item = ContentItem {
            id: 1,
            source_id: 1,
            title: "Launch thread".into(),
            description: None,
            content_url: None,
            author: None,
            published_at: None,
            metrics: [("likes".to_string(), 120), ("replies".to_string(), 8)]
                .into_iter()
                .collect(),
            enclosure_url: None,
            is_paywalled: false,
            fingerprint: "sha256:ab".into(),
            created_at: 0,
        };

        let prompt = build_prompt("Summarize", &[item]);
        assert_eq!(
            prompt,
            "Summarize\n\nContent to analyze:\nTitle: Launch thread\nEngagement: likes: 120, replies: 8\n---\n\n\
             Please provide a comprehensive summary based on the above prompt and content."
        );
    }

    #[test]
    fn test_preset_prompts_are_distinct() {
        let prompts = [
            AnalysisPreset::BusinessModels.prompt(),
            AnalysisPreset::CreatorEconomy.prompt(),
            AnalysisPreset::VcTrends.prompt(),
        ];
        assert!(prompts[0].contains("media business models"));
        assert!(prompts[1].contains("creator economy"));
        assert!(prompts[2].contains("VC investment"));
    }
}
