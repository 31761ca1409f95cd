//! Pipeline orchestration: ingestion, downloads, fingerprinting, duplicate
//! grouping, classification passes, and JSON export.

use std::path::PathBuf;
use std::time::Duration;

use roomfeed_storage::HttpClientConfig;

pub mod classify;
pub mod dedup;
pub mod download;
pub mod export;
pub mod ingest;
pub mod phash;

pub use classify::{classify_visual, reclassify_text, ClassifyReport};
pub use dedup::{DedupEngine, DedupError, DedupReport, DuplicateGroup};
pub use download::{DownloadManager, DownloadOutcome};
pub use export::{export_json, ExportFilters};
pub use ingest::{normalize, IngestCoordinator, IngestError};
pub use phash::{Fingerprint, PhashError, PhashIndex, DEFAULT_THRESHOLD};

pub const CRATE_NAME: &str = "roomfeed-pipeline";

/// Environment-backed pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub image_root: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: Option<String>,
    pub download_concurrency: usize,
    pub dedup_threshold: u32,
    pub http_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/roomfeed.db"),
            image_root: PathBuf::from("data/images"),
            sources_path: PathBuf::from("sources.yaml"),
            user_agent: None,
            download_concurrency: 4,
            dedup_threshold: DEFAULT_THRESHOLD,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Read configuration from `ROOMFEED_*` variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: env_path("ROOMFEED_DB_PATH").unwrap_or(defaults.database_path),
            image_root: env_path("ROOMFEED_IMAGE_ROOT").unwrap_or(defaults.image_root),
            sources_path: env_path("ROOMFEED_SOURCES").unwrap_or(defaults.sources_path),
            user_agent: std::env::var("ROOMFEED_USER_AGENT").ok().filter(|v| !v.is_empty()),
            download_concurrency: env_parsed("ROOMFEED_DOWNLOAD_CONCURRENCY")
                .unwrap_or(defaults.download_concurrency),
            dedup_threshold: env_parsed("ROOMFEED_DEDUP_THRESHOLD")
                .unwrap_or(defaults.dedup_threshold),
            http_timeout: env_parsed("ROOMFEED_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = PipelineConfig::default();
        assert_eq!(config.dedup_threshold, 8);
        assert_eq!(config.download_concurrency, 4);
        assert_eq!(config.database_path, PathBuf::from("data/roomfeed.db"));
    }

    #[test]
    fn http_config_carries_the_user_agent() {
        let config = PipelineConfig {
            user_agent: Some("roomfeed/0.1".into()),
            http_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let http = config.http_config();
        assert_eq!(http.user_agent.as_deref(), Some("roomfeed/0.1"));
        assert_eq!(http.timeout, Duration::from_secs(10));
    }
}
