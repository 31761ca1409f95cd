//! Browser-capture adapter: a saved HTML listing page (the output of a
//! scripted browser session) parsed into candidates with CSS selectors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use roomfeed_core::RawCandidate;
use roomfeed_storage::{FileStore, HttpFetcher};
use scraper::{Html, Selector};

use crate::{AdapterError, CandidateStream, SearchSpec, SourceAdapter, SourceKind, VecStream};

#[derive(Debug, Clone)]
pub struct HtmlCaptureAdapter {
    source_id: String,
    capture_path: PathBuf,
}

impl HtmlCaptureAdapter {
    pub fn new(source_id: impl Into<String>, capture_path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            capture_path: capture_path.into(),
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Parse the capture synchronously; `Html` is not `Send` and must never
/// live across an await point.
fn parse_capture(html_text: &str, source_id: &str) -> Result<Vec<RawCandidate>, AdapterError> {
    let document = Html::parse_document(html_text);
    let img_sel = selector("img[src]")?;
    let caption_sel = selector("figcaption")?;

    let mut candidates = Vec::new();
    for img in document.select(&img_sel) {
        let Some(src) = img.value().attr("src") else {
            continue;
        };
        if !src.starts_with("http") {
            continue;
        }

        // Stable id derived from the image URL so re-ingesting the same
        // capture stays idempotent.
        let natural_id = FileStore::sha256_hex(src.as_bytes())[..16].to_string();

        let mut candidate = RawCandidate::new(source_id, natural_id, src);
        candidate.title = img.value().attr("alt").and_then(|a| text_or_none(a.to_string()));

        // Nearest figure caption, when the markup provides one.
        if candidate.title.is_none() {
            if let Some(caption) = img
                .ancestors()
                .filter_map(scraper::ElementRef::wrap)
                .find(|el| el.value().name() == "figure")
                .and_then(|figure| figure.select(&caption_sel).next())
            {
                candidate.description = text_or_none(caption.text().collect::<String>());
            }
        }

        let width = img.value().attr("width").and_then(|w| w.parse().ok());
        let height = img.value().attr("height").and_then(|h| h.parse().ok());
        candidate.width = width;
        candidate.height = height;

        candidates.push(candidate);
    }
    Ok(candidates)
}

#[async_trait]
impl SourceAdapter for HtmlCaptureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::BrowserCapture
    }

    async fn open(
        &self,
        _http: Arc<HttpFetcher>,
        _spec: &SearchSpec,
    ) -> Result<Box<dyn CandidateStream>, AdapterError> {
        let path: &Path = &self.capture_path;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading capture {}", path.display()))?;
        let candidates = parse_capture(&text, &self.source_id)?;
        Ok(Box::new(VecStream::new(candidates)))
    }
}
