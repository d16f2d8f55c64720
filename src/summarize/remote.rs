use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ModelRequest, ModelResponse, SummarizationError, Summarizer};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const TEMPERATURE: f32 = 0.7;
/// Cap on error bodies quoted back to the caller.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// OpenAI-compatible chat completions client.
pub struct RemoteSummarizer {
    api_url: String,
    api_key: SecretString,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for RemoteSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSummarizer")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteSummarizer {
    pub fn new(api_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key,
            model: model.into(),
            timeout: Duration::from_secs(60),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Summarizer for RemoteSummarizer {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, SummarizationError> {
        let req_body = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: TEMPERATURE,
        };

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.api_url)
                .bearer_auth(self.api_key.expose_secret())
                .json(&req_body)
                .send(),
        )
        .await
        .map_err(|_| SummarizationError::ServiceUnavailable("request timed out".into()))?
        .map_err(|e| SummarizationError::ServiceUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Summarization API returned an error");
            return Err(classify_error(status.as_u16(), &body));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            SummarizationError::ServiceUnavailable(format!("malformed response: {e}"))
        })?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                SummarizationError::ServiceUnavailable("response contained no completion".into())
            })?;

        Ok(ModelResponse {
            text,
            model: body.model.unwrap_or_else(|| self.model.clone()),
            tokens_used: body.usage.and_then(|u| u.total_tokens),
        })
    }
}

/// Map a non-2xx response onto the error taxonomy.
fn classify_error(status: u16, body: &str) -> SummarizationError {
    let error = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|e| e.error);
    let code = error.as_ref().and_then(|e| e.code.as_deref());
    let message = error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_CHARS).collect());

    if status == 429 || code == Some("insufficient_quota") {
        return SummarizationError::QuotaExceeded;
    }

    match status {
        400..=499 => SummarizationError::InvalidRequest(format!("HTTP {status}: {message}")),
        _ => SummarizationError::ServiceUnavailable(format!("HTTP {status}: {message}")),
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}
