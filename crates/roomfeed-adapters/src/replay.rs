//! File-replay adapter: candidates captured to a JSON file, replayed as a
//! lazy stream. Used for gated sources whose captures are produced by hand
//! or by an external browser session, and for deterministic tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use roomfeed_core::RawCandidate;
use roomfeed_storage::HttpFetcher;
use serde::Deserialize;

use crate::{AdapterError, CandidateStream, SearchSpec, SourceAdapter, SourceKind, VecStream};

/// Capture record. `source` may be omitted in the file; the adapter's own
/// id fills it in.
#[derive(Debug, Clone, Deserialize)]
struct CaptureRecord {
    #[serde(default)]
    source: Option<String>,
    source_id: String,
    image_url: String,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    style_tags: Vec<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    engagement: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ReplayJsonAdapter {
    source_id: String,
    capture_path: PathBuf,
}

impl ReplayJsonAdapter {
    pub fn new(source_id: impl Into<String>, capture_path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            capture_path: capture_path.into(),
        }
    }
}

fn load_capture(path: &Path, source_id: &str) -> anyhow::Result<Vec<RawCandidate>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading capture {}", path.display()))?;
    let records: Vec<CaptureRecord> =
        serde_json::from_str(&text).with_context(|| format!("parsing capture {}", path.display()))?;

    Ok(records
        .into_iter()
        .map(|r| {
            let mut c = RawCandidate::new(
                r.source.unwrap_or_else(|| source_id.to_string()),
                r.source_id,
                r.image_url,
            );
            c.source_url = r.source_url;
            c.thumbnail_url = r.thumbnail_url;
            c.title = r.title;
            c.description = r.description;
            c.prompt = r.prompt;
            c.style_tags = r.style_tags;
            c.width = r.width;
            c.height = r.height;
            c.engagement = r.engagement;
            c
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for ReplayJsonAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Replay
    }

    async fn open(
        &self,
        _http: Arc<HttpFetcher>,
        _spec: &SearchSpec,
    ) -> Result<Box<dyn CandidateStream>, AdapterError> {
        let candidates = load_capture(&self.capture_path, &self.source_id)?;
        Ok(Box::new(VecStream::new(candidates)))
    }
}
