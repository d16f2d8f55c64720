//! Configuration file parser for config.toml.
//!
//! The config file is optional. A missing or empty file yields
//! `Config::default()`. Unknown top-level keys are accepted but logged, since
//! they are usually typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FetchPolicy, DEFAULT_MAX_BODY_BYTES};
use crate::ingest::IngestOptions;
use crate::storage::NewSource;
use crate::summarize::{DEFAULT_API_URL, DEFAULT_MODEL};
use crate::util::validate_source_url;

/// Environment variable that overrides `[summarizer] api_key`.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_USER_AGENT: &str = concat!("media-monitor/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,

    /// Content older than this many days is removed by `cleanup`.
    pub retention_days: u32,

    pub fetch: FetchConfig,

    pub summarizer: SummarizerConfig,

    /// Seed list synced into the sources table on startup.
    pub sources: Vec<NewSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "media_monitor.db".to_string(),
            retention_days: 90,
            fetch: FetchConfig::default(),
            summarizer: SummarizerConfig::default(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Sources fetched in parallel, 1..=32.
    pub max_concurrent: usize,
    pub run_timeout_secs: u64,
    pub user_agent: String,
    pub max_feed_bytes: usize,
    /// Fetch article pages of new items to look for paywall markers.
    pub detect_paywalls: bool,
    /// Permit source URLs and article links on loopback or private networks.
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1000,
            max_concurrent: 8,
            run_timeout_secs: 600,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_feed_bytes: DEFAULT_MAX_BODY_BYTES,
            detect_paywalls: false,
            allow_private_hosts: false,
        }
    }
}

/// Custom Debug impl masks `api_key`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Env var takes precedence over config file.
    pub api_key: Option<String>,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 1000,
            timeout_secs: 60,
            api_key: None,
        }
    }
}

impl std::fmt::Debug for SummarizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizerConfig")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl SummarizerConfig {
    /// API key from `OPENAI_API_KEY`, else from the config file.
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        Self::pick_api_key(std::env::var(API_KEY_ENV).ok(), self.api_key.as_deref())
    }

    fn pick_api_key(env: Option<String>, file: Option<&str>) -> Option<SecretString> {
        env.filter(|k| !k.trim().is_empty())
            .or_else(|| file.filter(|k| !k.trim().is_empty()).map(str::to_owned))
            .map(SecretString::from)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "database_path",
        "retention_days",
        "fetch",
        "summarizer",
        "sources",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=32).contains(&self.fetch.max_concurrent) {
            return Err(ConfigError::Invalid(format!(
                "fetch.max_concurrent must be between 1 and 32, got {}",
                self.fetch.max_concurrent
            )));
        }
        if self.fetch.timeout_secs == 0 || self.fetch.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch timeouts must be greater than zero".into(),
            ));
        }
        if self.fetch.max_feed_bytes == 0 {
            return Err(ConfigError::Invalid(
                "fetch.max_feed_bytes must be greater than zero".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source '{}' is listed more than once",
                    source.name
                )));
            }
            source
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("source '{}': {}", source.name, e)))?;
            validate_source_url(&source.url, self.fetch.allow_private_hosts)
                .map_err(|e| ConfigError::Invalid(format!("source '{}': {}", source.name, e)))?;
        }
        Ok(())
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            max_retries: self.fetch.max_retries,
            backoff_base: Duration::from_millis(self.fetch.backoff_base_ms),
            max_body_bytes: self.fetch.max_feed_bytes,
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            max_concurrent: self.fetch.max_concurrent,
            run_timeout: Duration::from_secs(self.fetch.run_timeout_secs),
            detect_paywalls: self.fetch.detect_paywalls,
            allow_private_hosts: self.fetch.allow_private_hosts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
