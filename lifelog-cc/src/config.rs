//! Configuration for lifelog-cc
//!
//! Bootstrap values come from the TOML file (`~/.config/lifelog/lifelog-cc.toml`),
//! overridden by command-line/environment arguments in `main`. Runtime
//! deduplication parameters may additionally be overridden from the `settings`
//! table (see `db::settings`).

use lifelog_common::config::LoggingConfig;
use lifelog_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the embedding API key
pub const EMBEDDING_API_KEY_ENV: &str = "LIFELOG_EMBEDDING_API_KEY";

/// Contents of the service TOML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// Deduplication and delivery parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Complete-linkage merge threshold τ (default: 0.85)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Lines with fewer words are rendered verbatim, never clustered (default: 3)
    #[serde(default = "default_min_words")]
    pub min_words: usize,

    /// Texts per embedding provider call (default: 32)
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,

    /// Allow lines of different speakers in one cluster (default: true)
    #[serde(default = "default_allow_cross_speaker")]
    pub allow_cross_speaker: bool,

    /// Lines per clustering window for oversized days (default: 300)
    #[serde(default = "default_max_window_lines")]
    pub max_window_lines: usize,

    /// Background scheduler interval in seconds (default: 2 hours)
    #[serde(default = "default_background_interval_secs")]
    pub background_interval_secs: u64,

    /// Days drained per scheduler run (default: 10)
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Days processed concurrently by one scheduler run (default: 2)
    #[serde(default = "default_scheduler_concurrency")]
    pub scheduler_concurrency: usize,

    /// Upper bound on scheduler backoff in seconds (default: 24 hours)
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// How long a request waits for a slow-path result (default: 30s)
    #[serde(default = "default_compute_timeout_secs")]
    pub compute_timeout_secs: u64,

    /// Automatic retries after a failed computation (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Simultaneous in-flight computations across all days (default: 2)
    #[serde(default = "default_max_concurrent_computations")]
    pub max_concurrent_computations: usize,

    /// Initial slow-path duration estimate in milliseconds (default: 6000)
    #[serde(default = "default_expected_compute_ms")]
    pub expected_compute_ms: u64,
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_min_words() -> usize {
    3
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_allow_cross_speaker() -> bool {
    true
}

fn default_max_window_lines() -> usize {
    300
}

fn default_background_interval_secs() -> u64 {
    2 * 60 * 60
}

fn default_batch_limit() -> usize {
    10
}

fn default_scheduler_concurrency() -> usize {
    2
}

fn default_max_backoff_secs() -> u64 {
    24 * 60 * 60
}

fn default_compute_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_concurrent_computations() -> usize {
    2
}

fn default_expected_compute_ms() -> u64 {
    6000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_words: default_min_words(),
            embedding_batch_size: default_embedding_batch_size(),
            allow_cross_speaker: default_allow_cross_speaker(),
            max_window_lines: default_max_window_lines(),
            background_interval_secs: default_background_interval_secs(),
            batch_limit: default_batch_limit(),
            scheduler_concurrency: default_scheduler_concurrency(),
            max_backoff_secs: default_max_backoff_secs(),
            compute_timeout_secs: default_compute_timeout_secs(),
            max_retries: default_max_retries(),
            max_concurrent_computations: default_max_concurrent_computations(),
            expected_compute_ms: default_expected_compute_ms(),
        }
    }
}

impl DedupConfig {
    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.embedding_batch_size == 0 {
            return Err(Error::Config("embedding_batch_size must be at least 1".to_string()));
        }
        if self.max_window_lines < 2 {
            return Err(Error::Config("max_window_lines must be at least 2".to_string()));
        }
        if self.batch_limit == 0 || self.scheduler_concurrency == 0 {
            return Err(Error::Config(
                "batch_limit and scheduler_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_computations == 0 {
            return Err(Error::Config(
                "max_concurrent_computations must be at least 1".to_string(),
            ));
        }
        if self.background_interval_secs == 0 || self.compute_timeout_secs == 0 {
            return Err(Error::Config(
                "background_interval_secs and compute_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs)
    }
}

/// Embedding provider connection settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Falls back to `LIFELOG_EMBEDDING_API_KEY` when unset
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_embedding_endpoint() -> String {
    "http://127.0.0.1:11434/v1/embeddings".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// API key from the TOML file, else from the environment
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(EMBEDDING_API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.similarity_threshold, 0.85);
        assert_eq!(config.min_words, 3);
        assert_eq!(config.background_interval(), Duration::from_secs(7200));
        assert_eq!(config.compute_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 2);
        assert!(config.allow_cross_speaker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed: ServiceConfig = toml::from_str(
            r#"
            port = 5810

            [dedup]
            similarity_threshold = 0.9
            allow_cross_speaker = false

            [embedding]
            model = "all-minilm"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.port, Some(5810));
        assert_eq!(parsed.dedup.similarity_threshold, 0.9);
        assert!(!parsed.dedup.allow_cross_speaker);
        assert_eq!(parsed.dedup.min_words, 3);
        assert_eq!(parsed.embedding.model, "all-minilm");
        assert_eq!(parsed.embedding.endpoint, default_embedding_endpoint());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = DedupConfig {
            similarity_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = DedupConfig {
            embedding_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
