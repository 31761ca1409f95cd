//! Source adapter contracts + replay-first adapter implementations.
//!
//! Every adapter, whatever its transport, hands the ingestion coordinator
//! the same thing: a pull-based stream of normalized candidates. The
//! coordinator decides when to stop pulling; adapters never push.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use roomfeed_core::{Classification, RawCandidate, RoomType};
use roomfeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod civitai;
mod command;
mod html_capture;
mod replay;

pub use civitai::CivitaiAdapter;
pub use command::CommandClassifier;
pub use html_capture::HtmlCaptureAdapter;
pub use replay::ReplayJsonAdapter;

pub const CRATE_NAME: &str = "roomfeed-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Transport family an adapter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    BrowserCapture,
    Replay,
}

/// What the caller asked a source for.
#[derive(Debug, Clone, Default)]
pub struct SearchSpec {
    pub query: Option<String>,
    pub room_type: Option<RoomType>,
    pub limit: usize,
}

impl SearchSpec {
    /// Combined query text, with the room type folded in the way the
    /// upstream search endpoints expect ("living room <query>").
    pub fn effective_query(&self) -> Option<String> {
        match (&self.query, self.room_type) {
            (Some(q), Some(room)) => Some(format!("{} {}", room.as_str().replace('_', " "), q)),
            (Some(q), None) => Some(q.clone()),
            (None, Some(room)) => Some(room.as_str().replace('_', " ")),
            (None, None) => None,
        }
    }
}

/// Lazy, cancellable candidate sequence. `next` returning `Ok(None)` means
/// the source is exhausted; the caller may simply stop pulling earlier.
#[async_trait]
pub trait CandidateStream: Send {
    async fn next(&mut self) -> Result<Option<RawCandidate>, AdapterError>;
}

/// Capability contract shared by all source variants.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn open(
        &self,
        http: Arc<HttpFetcher>,
        spec: &SearchSpec,
    ) -> Result<Box<dyn CandidateStream>, AdapterError>;
}

/// Opaque visual classifier. The model behind this seam (CLIP or
/// otherwise) is deliberately out of scope; the pipeline only consumes
/// the scoring function.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;
    fn classify(&self, image_bytes: &[u8]) -> anyhow::Result<Classification>;
}

/// In-memory stream over pre-parsed candidates. Replay-style adapters
/// parse their capture eagerly and stream from this.
pub struct VecStream {
    candidates: std::collections::VecDeque<RawCandidate>,
}

impl VecStream {
    pub fn new(candidates: Vec<RawCandidate>) -> Self {
        Self {
            candidates: candidates.into(),
        }
    }
}

#[async_trait]
impl CandidateStream for VecStream {
    async fn next(&mut self) -> Result<Option<RawCandidate>, AdapterError> {
        Ok(self.candidates.pop_front())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub capture_path: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// Build the adapter a registry entry describes.
pub fn adapter_for(config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match config.kind {
        SourceKind::Api => Ok(Box::new(CivitaiAdapter::new(
            config.source_id.clone(),
            config
                .base_url
                .clone()
                .unwrap_or_else(|| civitai::DEFAULT_BASE_URL.to_string()),
        ))),
        SourceKind::Replay => {
            let path = config.capture_path.clone().ok_or_else(|| {
                AdapterError::Message(format!(
                    "replay source {} has no capture_path",
                    config.source_id
                ))
            })?;
            Ok(Box::new(ReplayJsonAdapter::new(config.source_id.clone(), path)))
        }
        SourceKind::BrowserCapture => {
            let path = config.capture_path.clone().ok_or_else(|| {
                AdapterError::Message(format!(
                    "browser-capture source {} has no capture_path",
                    config.source_id
                ))
            })?;
            Ok(Box::new(HtmlCaptureAdapter::new(config.source_id.clone(), path)))
        }
    }
}
