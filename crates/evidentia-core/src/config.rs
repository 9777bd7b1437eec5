use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "EVIDENTIA_";

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Runtime knobs for the ingestion pipeline.
///
/// Every field can be overridden from the environment with an
/// `EVIDENTIA_` prefixed variable, e.g. `EVIDENTIA_MAX_UPLOAD_BYTES`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hard ceiling for a single upload.
    pub max_upload_bytes: u64,
    /// Upper bound on in-flight extraction calls per evidence item.
    pub extraction_concurrency: usize,
    /// Upper bound on in-flight embedding calls per evidence item.
    pub embedding_concurrency: usize,
    pub extraction_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
    /// Extra attempts for a failed graph batch before the stage fails.
    pub graph_batch_retries: u32,
    pub retry_backoff_ms: u64,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub extraction_url: Option<String>,
    pub embedding_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            extraction_concurrency: 10,
            embedding_concurrency: 10,
            extraction_timeout_secs: 30,
            embedding_timeout_secs: 30,
            graph_batch_retries: 2,
            retry_backoff_ms: 200,
            data_dir: default_data_dir(),
            database_url: None,
            extraction_url: None,
            embedding_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES").unwrap_or(defaults.max_upload_bytes),
            extraction_concurrency: env_parse("EXTRACTION_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.extraction_concurrency),
            embedding_concurrency: env_parse("EMBEDDING_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.embedding_concurrency),
            extraction_timeout_secs: env_parse("EXTRACTION_TIMEOUT_SECS")
                .unwrap_or(defaults.extraction_timeout_secs),
            embedding_timeout_secs: env_parse("EMBEDDING_TIMEOUT_SECS")
                .unwrap_or(defaults.embedding_timeout_secs),
            graph_batch_retries: env_parse("GRAPH_BATCH_RETRIES")
                .unwrap_or(defaults.graph_batch_retries),
            retry_backoff_ms: env_parse("RETRY_BACKOFF_MS").unwrap_or(defaults.retry_backoff_ms),
            data_dir: env_var("DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            database_url: env_var("DATABASE_URL"),
            extraction_url: env_var("EXTRACTION_URL"),
            embedding_url: env_var("EMBEDDING_URL"),
        }
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    #[must_use]
    pub const fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite:{}?mode=rwc",
                self.data_dir.join("evidentia.db").display()
            )
        })
    }

    pub fn blob_root(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub const fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub const fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("evidentia")
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}
