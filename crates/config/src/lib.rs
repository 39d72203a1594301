//! Configuration loading, validation, and management for voxrelay.
//!
//! Loads configuration from a TOML file with environment variable
//! overrides. All tuning values the pipeline uses — retry counts, edit
//! throttle intervals, merge windows — live here rather than as hardcoded
//! constants; the defaults match production tuning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// The root configuration structure.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion service settings
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Conversational memory settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Transcript completeness filter settings
    #[serde(default)]
    pub transcript: TranscriptConfig,

    /// Incremental delivery scheduler settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Admission queue limits
    #[serde(default)]
    pub queue: QueueConfig,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("completion", &self.completion)
            .field("memory", &self.memory)
            .field("transcript", &self.transcript)
            .field("delivery", &self.delivery)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Settings for the streaming completion client.
#[derive(Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (override with VOXRELAY_API_KEY)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model to request
    #[serde(default = "default_model")]
    pub model: String,

    /// Output token budget for plain text responses
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Larger budget used when a tool schema is supplied
    #[serde(default = "default_tool_max_tokens")]
    pub tool_max_tokens: u32,

    /// Additional attempts after a transient (5xx) failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff unit: delay = backoff_ms × attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Minimum words before a clause separator may end a spoken chunk
    #[serde(default = "default_min_words_clause")]
    pub min_words_clause: usize,
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("tool_max_tokens", &self.tool_max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("min_words_clause", &self.min_words_clause)
            .finish()
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            tool_max_tokens: default_tool_max_tokens(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            min_words_clause: default_min_words_clause(),
        }
    }
}

/// Settings for the conversational memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum turns kept per session
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Non-permanent turns older than this are expired
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Snapshot file location; `None` disables persistence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            expiry_secs: default_expiry_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            snapshot_path: None,
        }
    }
}

/// Settings for the transcript completeness filter. Runtime-mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptConfig {
    /// How long a buffered fragment waits for a continuation
    #[serde(default = "default_continuation_timeout_ms")]
    pub continuation_timeout_ms: u64,

    /// Maximum age of a buffered fragment for merging
    #[serde(default = "default_merge_window_ms")]
    pub merge_window_ms: u64,

    /// Below this word count, weak incompleteness patterns also apply
    #[serde(default = "default_min_words_for_complete")]
    pub min_words_for_complete: usize,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            continuation_timeout_ms: default_continuation_timeout_ms(),
            merge_window_ms: default_merge_window_ms(),
            min_words_for_complete: default_min_words_for_complete(),
        }
    }
}

/// Settings for the incremental delivery scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Edits allowed per rolling window before sustained fallback.
    /// One below the observed platform ceiling, for headroom.
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Length of the rolling burst window
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,

    /// Delay between edits while burst budget remains
    #[serde(default = "default_burst_interval_ms")]
    pub burst_interval_ms: u64,

    /// Delay between edits once the burst budget is spent
    #[serde(default = "default_sustained_interval_ms")]
    pub sustained_interval_ms: u64,

    /// Practical per-message length ceiling (margin under the platform's)
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Pause between multi-chunk follow-up sends, to preserve ordering
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            burst_limit: default_burst_limit(),
            burst_window_ms: default_burst_window_ms(),
            burst_interval_ms: default_burst_interval_ms(),
            sustained_interval_ms: default_sustained_interval_ms(),
            max_message_len: default_max_message_len(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

/// Admission queue concurrency limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent text responses
    #[serde(default = "default_text_max_concurrent")]
    pub text_max_concurrent: usize,

    /// Concurrent image-generation jobs
    #[serde(default = "default_image_max_concurrent")]
    pub image_max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            text_max_concurrent: default_text_max_concurrent(),
            image_max_concurrent: default_image_max_concurrent(),
        }
    }
}

// --- Defaults ---

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_tool_max_tokens() -> u32 {
    4096
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_min_words_clause() -> usize {
    6
}
fn default_max_messages() -> usize {
    100
}
fn default_expiry_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_continuation_timeout_ms() -> u64 {
    3000
}
fn default_merge_window_ms() -> u64 {
    4000
}
fn default_min_words_for_complete() -> usize {
    6
}
fn default_burst_limit() -> u32 {
    4
}
fn default_burst_window_ms() -> u64 {
    5000
}
fn default_burst_interval_ms() -> u64 {
    100
}
fn default_sustained_interval_ms() -> u64 {
    1050
}
fn default_max_message_len() -> usize {
    1900
}
fn default_chunk_delay_ms() -> u64 {
    500
}
fn default_text_max_concurrent() -> usize {
    3
}
fn default_image_max_concurrent() -> usize {
    100
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply env overrides.
    ///
    /// A missing file yields defaults (still subject to env overrides).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&content)?
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `VOXRELAY_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("VOXRELAY_API_KEY") {
            if !key.is_empty() {
                self.completion.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("VOXRELAY_BASE_URL") {
            if !url.is_empty() {
                self.completion.base_url = url;
            }
        }
        if let Ok(model) = std::env::var("VOXRELAY_MODEL") {
            if !model.is_empty() {
                self.completion.model = model;
            }
        }
    }

    /// Validate settings that would break the pipeline at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion.base_url.is_empty() {
            return Err(ConfigError::Validation("completion.base_url is empty".into()));
        }
        if self.completion.model.is_empty() {
            return Err(ConfigError::Validation("completion.model is empty".into()));
        }
        if self.memory.max_messages == 0 {
            return Err(ConfigError::Validation(
                "memory.max_messages must be at least 1".into(),
            ));
        }
        if self.delivery.burst_limit == 0 {
            return Err(ConfigError::Validation(
                "delivery.burst_limit must be at least 1".into(),
            ));
        }
        if self.delivery.max_message_len < 100 {
            return Err(ConfigError::Validation(
                "delivery.max_message_len must be at least 100".into(),
            ));
        }
        if self.queue.text_max_concurrent == 0 || self.queue.image_max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "queue limits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.burst_limit, 4);
        assert_eq!(config.delivery.sustained_interval_ms, 1050);
        assert_eq!(config.transcript.merge_window_ms, 4000);
        assert_eq!(config.memory.max_messages, 100);
        assert_eq!(config.completion.max_retries, 2);
    }

    #[test]
    fn loads_partial_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[completion]
model = "gpt-4o"
max_tokens = 2048

[delivery]
burst_limit = 3
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.completion.model, "gpt-4o");
        assert_eq!(config.completion.max_tokens, 2048);
        assert_eq!(config.delivery.burst_limit, 3);
        // Unspecified sections keep defaults
        assert_eq!(config.delivery.sustained_interval_ms, 1050);
        assert_eq!(config.queue.text_max_concurrent, 3);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/voxrelay.toml")).unwrap();
        assert_eq!(config.completion.max_tokens, 1024);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = AppConfig::default();
        config.memory.max_messages = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.delivery.max_message_len = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.completion.api_key = Some("sk-secret-key".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-key"));
        assert!(debug.contains("[REDACTED]"));
    }
}
