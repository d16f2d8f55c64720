use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default retry count after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default first backoff delay; doubled on each retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Default response body cap.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching a feed or article.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Attempt exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the size limit
    #[error("Response too large (limit {limit} bytes)")]
    ResponseTooLarge { limit: usize },
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Outcome classification of a fetch, as reported per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    HttpError(u16),
    Timeout,
    NetworkError,
}

impl FetchError {
    pub fn status(&self) -> FetchStatus {
        match self {
            FetchError::HttpStatus(code) => FetchStatus::HttpError(*code),
            FetchError::Timeout => FetchStatus::Timeout,
            FetchError::Network(e) if e.is_timeout() => FetchStatus::Timeout,
            FetchError::Network(_)
            | FetchError::ResponseTooLarge { .. }
            | FetchError::IncompleteResponse { .. } => FetchStatus::NetworkError,
        }
    }

    /// Whether another attempt might succeed.
    ///
    /// HTTP errors are final; so is an oversized body, which will not shrink.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::ResponseTooLarge { .. } | FetchError::HttpStatus(_) => false,
            FetchError::Timeout
            | FetchError::Network(_)
            | FetchError::IncompleteResponse { .. } => true,
        }
    }
}

/// Retry and resource limits for a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_body_bytes: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl FetchPolicy {
    /// Delay before retry number `retry` (0-based): base, 2×base, 4×base, …
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

/// A successfully downloaded body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    /// URL after redirects, used to resolve relative links
    pub final_url: url::Url,
    pub content_type: Option<String>,
}

/// HTTP GET with per-attempt timeout, bounded body and exponential backoff.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl Fetcher {
    /// Build a fetcher with its own client sending `user_agent`.
    pub fn new(user_agent: &str, policy: FetchPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client, policy })
    }

    pub fn with_client(client: reqwest::Client, policy: FetchPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetch `url`, retrying timeouts and network failures up to
    /// `max_retries` times.
    ///
    /// # Errors
    ///
    /// - [`FetchError::HttpStatus`] - non-2xx response (not retried)
    /// - [`FetchError::ResponseTooLarge`] - body over the limit (not retried)
    /// - [`FetchError::Timeout`] / [`FetchError::Network`] /
    ///   [`FetchError::IncompleteResponse`] - after the last retry
    pub async fn fetch(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let mut retry_count = 0;

        loop {
            let result = tokio::time::timeout(self.policy.timeout, self.attempt(url))
                .await
                .unwrap_or(Err(FetchError::Timeout));

            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && retry_count < self.policy.max_retries => {
                    let delay = self.policy.backoff(retry_count);
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = read_limited_bytes(response, self.policy.max_body_bytes).await?;

        Ok(FetchedBody {
            bytes,
            final_url,
            content_type,
        })
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge { limit });
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    // Connection dropped mid-body
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
