//! Batch image downloads: bounded concurrency, per-record outcomes.

use std::collections::BTreeMap;
use std::sync::Arc;

use roomfeed_core::ImageRecord;
use roomfeed_storage::{FileStore, HttpFetcher, ImageStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded {
        path: String,
        content_hash: String,
        width: u32,
        height: u32,
        deduplicated: bool,
    },
    /// Already on disk and `redownload` was not requested.
    Skipped {
        path: String,
        content_hash: Option<String>,
    },
    Failed {
        error: String,
        permanent: bool,
    },
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, DownloadOutcome::Failed { .. })
    }
}

pub struct DownloadManager {
    store: ImageStore,
    files: FileStore,
    http: Arc<HttpFetcher>,
}

impl DownloadManager {
    pub fn new(store: ImageStore, files: FileStore, http: Arc<HttpFetcher>) -> Self {
        Self { store, files, http }
    }

    /// Download every record, at most `concurrency` at a time. One record's
    /// failure never aborts the batch; each id maps to its own outcome.
    pub async fn download_batch(
        &self,
        records: Vec<ImageRecord>,
        concurrency: usize,
        redownload: bool,
    ) -> BTreeMap<i64, DownloadOutcome> {
        let limit = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers = JoinSet::new();

        for record in records {
            let store = self.store.clone();
            let files = self.files.clone();
            let http = Arc::clone(&self.http);
            let limit = Arc::clone(&limit);
            workers.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let id = record.id;
                (id, download_one(&store, &files, &http, &record, redownload).await)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    outcomes.insert(id, outcome);
                }
                Err(err) => warn!(error = %err, "download worker panicked"),
            }
        }

        let failed = outcomes.values().filter(|o| !o.is_success()).count();
        info!(total = outcomes.len(), failed, "download batch finished");
        outcomes
    }
}

async fn download_one(
    store: &ImageStore,
    files: &FileStore,
    http: &HttpFetcher,
    record: &ImageRecord,
    redownload: bool,
) -> DownloadOutcome {
    if !redownload {
        if let Some(path) = record.local_path.as_deref().filter(|p| !p.is_empty()) {
            debug!(id = record.id, path, "already downloaded, skipping");
            return DownloadOutcome::Skipped {
                path: path.to_string(),
                content_hash: record.content_hash.clone(),
            };
        }
    }

    let response = match http.fetch_bytes(&record.source, &record.image_url).await {
        Ok(response) => response,
        Err(err) => {
            return DownloadOutcome::Failed {
                permanent: err.is_permanent(),
                error: err.to_string(),
            }
        }
    };

    // Reject bodies that are not decodable images (error pages, truncated
    // payloads) before anything touches disk.
    let decoded = match image::load_from_memory(&response.body) {
        Ok(decoded) => decoded,
        Err(err) => {
            return DownloadOutcome::Failed {
                permanent: true,
                error: format!("undecodable image body: {err}"),
            }
        }
    };
    let (width, height) = (decoded.width(), decoded.height());

    let extension = extension_for(&record.image_url, response.content_type.as_deref());
    let stored = match files.store_bytes(&record.source, &extension, &response.body).await {
        Ok(stored) => stored,
        Err(err) => {
            return DownloadOutcome::Failed {
                permanent: false,
                error: err.to_string(),
            }
        }
    };

    let path = stored.relative_path.to_string_lossy().into_owned();
    if let Err(err) = store
        .set_local_file(record.id, &path, &stored.content_hash, Some(width), Some(height))
        .await
    {
        return DownloadOutcome::Failed {
            permanent: false,
            error: err.to_string(),
        };
    }

    debug!(id = record.id, path, bytes = stored.byte_size, "downloaded image");
    DownloadOutcome::Downloaded {
        path,
        content_hash: stored.content_hash,
        width,
        height,
        deduplicated: stored.deduplicated,
    }
}

/// Pick a file extension, preferring the Content-Type over the URL path.
fn extension_for(url: &str, content_type: Option<&str>) -> String {
    if let Some(content_type) = content_type {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        match mime {
            "image/jpeg" => return "jpg".into(),
            "image/png" => return "png".into(),
            "image/webp" => return "webp".into(),
            "image/gif" => return "gif".into(),
            _ => {}
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".into())
}
