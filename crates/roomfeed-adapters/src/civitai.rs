//! API adapter for Civitai's public `/images` endpoint: cursor-paged JSON,
//! pulled one page at a time as the coordinator drains the stream.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use roomfeed_core::RawCandidate;
use roomfeed_storage::HttpFetcher;
use serde::Deserialize;

use crate::{AdapterError, CandidateStream, SearchSpec, SourceAdapter, SourceKind};

pub const DEFAULT_BASE_URL: &str = "https://civitai.com/api/v1";

/// API max page size is 100.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct CivitaiAdapter {
    source_id: String,
    base_url: String,
}

impl CivitaiAdapter {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesPage {
    #[serde(default)]
    items: Vec<ImageItem>,
    #[serde(default)]
    metadata: PageMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PageMetadata {
    #[serde(rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    id: Option<serde_json::Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    meta: Option<ItemMeta>,
    #[serde(default)]
    stats: Option<ItemStats>,
}

#[derive(Debug, Default, Deserialize)]
struct ItemMeta {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ItemStats {
    #[serde(rename = "heartCount", default)]
    heart_count: i64,
    #[serde(rename = "likeCount", default)]
    like_count: i64,
    #[serde(rename = "laughCount", default)]
    laugh_count: i64,
    #[serde(rename = "cryCount", default)]
    cry_count: i64,
}

#[derive(Debug)]
struct ParsedPage {
    candidates: Vec<RawCandidate>,
    next_cursor: Option<String>,
    /// Raw item count before filtering; drives the exhaustion decision so a
    /// page of unusable items does not end pagination early.
    raw_items: usize,
}

impl ParsedPage {
    fn is_last(&self) -> bool {
        self.raw_items == 0 || self.next_cursor.is_none()
    }
}

/// Parse one API page into candidates + the next cursor. Items missing an
/// id or URL are dropped, matching the endpoint's occasional null fields.
fn parse_page(body: &[u8], source_id: &str) -> Result<ParsedPage, AdapterError> {
    let page: ImagesPage = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Message(format!("invalid images page: {e}")))?;

    let raw_items = page.items.len();
    let candidates = page
        .items
        .into_iter()
        .filter_map(|item| {
            let id = match item.id? {
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::String(s) if !s.is_empty() => s,
                _ => return None,
            };
            let url = item.url.filter(|u| !u.is_empty())?;

            let mut c = RawCandidate::new(source_id, id, url);
            c.width = item.width;
            c.height = item.height;
            c.prompt = item.meta.and_then(|m| m.prompt);
            c.engagement = item.stats.map(|s| {
                s.heart_count + s.like_count + s.laugh_count + s.cry_count
            });
            Some(c)
        })
        .collect();

    Ok(ParsedPage {
        candidates,
        next_cursor: page.metadata.next_cursor,
        raw_items,
    })
}

struct CivitaiStream {
    http: Arc<HttpFetcher>,
    source_id: String,
    base_url: String,
    query: Option<String>,
    buffer: VecDeque<RawCandidate>,
    cursor: Option<String>,
    exhausted: bool,
}

impl CivitaiStream {
    fn page_url(&self) -> String {
        let mut url = format!(
            "{}/images?limit={}&sort=Most%20Reactions&period=AllTime&nsfw=false",
            self.base_url, PAGE_SIZE
        );
        if let Some(query) = &self.query {
            url.push_str("&query=");
            url.push_str(&urlencode(query));
        }
        if let Some(cursor) = &self.cursor {
            url.push_str("&cursor=");
            url.push_str(&urlencode(cursor));
        }
        url
    }

    async fn fetch_next_page(&mut self) -> Result<(), AdapterError> {
        let url = self.page_url();
        let response = self.http.fetch_bytes(&self.source_id, &url).await?;
        let parsed = parse_page(&response.body, &self.source_id)?;

        if parsed.is_last() {
            self.exhausted = true;
        }
        self.cursor = parsed.next_cursor;
        self.buffer.extend(parsed.candidates);
        Ok(())
    }
}

#[async_trait]
impl CandidateStream for CivitaiStream {
    async fn next(&mut self) -> Result<Option<RawCandidate>, AdapterError> {
        // A page can filter down to nothing while the cursor continues, so
        // keep paging until something usable turns up or the source ends.
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_next_page().await?;
        }
        Ok(self.buffer.pop_front())
    }
}

#[async_trait]
impl SourceAdapter for CivitaiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn open(
        &self,
        http: Arc<HttpFetcher>,
        spec: &SearchSpec,
    ) -> Result<Box<dyn CandidateStream>, AdapterError> {
        Ok(Box::new(CivitaiStream {
            http,
            source_id: self.source_id.clone(),
            base_url: self.base_url.clone(),
            query: spec.effective_query(),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }))
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "items": [
            {
                "id": 101,
                "url": "https://image.civitai.example/101.jpeg",
                "width": 1024,
                "height": 1536,
                "meta": {"prompt": "scandinavian living room, soft light"},
                "stats": {"heartCount": 12, "likeCount": 30, "laughCount": 1, "cryCount": 0}
            },
            {"id": null, "url": "https://image.civitai.example/no-id.jpeg"},
            {"id": 103, "url": ""}
        ],
        "metadata": {"nextCursor": "abc|123"}
    }"#;

    #[test]
    fn parses_items_and_sums_reactions() {
        let parsed = parse_page(PAGE.as_bytes(), "civitai").unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.raw_items, 3);
        let c = &parsed.candidates[0];
        assert_eq!(c.source_id, "101");
        assert_eq!(c.engagement, Some(43));
        assert_eq!(c.prompt.as_deref(), Some("scandinavian living room, soft light"));
        assert_eq!(parsed.next_cursor.as_deref(), Some("abc|123"));
    }

    #[test]
    fn unusable_page_with_cursor_keeps_paging() {
        let page = r#"{
            "items": [
                {"id": null, "url": "https://image.civitai.example/no-id.jpeg"},
                {"id": 7, "url": null}
            ],
            "metadata": {"nextCursor": "next"}
        }"#;
        let parsed = parse_page(page.as_bytes(), "civitai").unwrap();
        assert!(parsed.candidates.is_empty());
        assert!(!parsed.is_last());

        let truly_empty = parse_page(br#"{"items": [], "metadata": {"nextCursor": "next"}}"#, "civitai").unwrap();
        assert!(truly_empty.is_last());

        let no_cursor = parse_page(PAGE.as_bytes(), "civitai").map(|p| ParsedPage {
            next_cursor: None,
            ..p
        });
        assert!(no_cursor.unwrap().is_last());
    }

    #[test]
    fn malformed_page_is_an_error() {
        assert!(parse_page(b"not json", "civitai").is_err());
    }

    #[test]
    fn page_url_encodes_query_and_cursor() {
        let stream = CivitaiStream {
            http: Arc::new(
                HttpFetcher::new(roomfeed_storage::HttpClientConfig::default()).unwrap(),
            ),
            source_id: "civitai".into(),
            base_url: DEFAULT_BASE_URL.into(),
            query: Some("living room décor".into()),
            buffer: VecDeque::new(),
            cursor: Some("abc|123".into()),
            exhausted: false,
        };
        let url = stream.page_url();
        assert!(url.contains("query=living%20room%20d%C3%A9cor"));
        assert!(url.contains("cursor=abc%7C123"));
    }
}
