//! Ingestion coordinator: drives one bounded adapter pull into the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use roomfeed_adapters::{SearchSpec, SourceAdapter};
use roomfeed_core::{classify_room_type, compute_quality_score, extract_style_tags, RawCandidate, RoomType, ScrapeRun};
use roomfeed_storage::{HttpFetcher, ImageStore, NewImage, StoreError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fill in what the adapter left blank: room type from the request or from
/// keyword classification, style tags from the text, and the quality score.
pub fn normalize(
    candidate: RawCandidate,
    requested_room: Option<RoomType>,
    scraped_at: DateTime<Utc>,
) -> NewImage {
    let text = candidate.classification_text();
    let room_type = candidate
        .room_type
        .or(requested_room)
        .or_else(|| classify_room_type(&text));

    let mut candidate = candidate;
    if candidate.style_tags.is_empty() {
        candidate.style_tags = extract_style_tags(&text);
    }

    let quality_score = compute_quality_score(
        candidate.width,
        candidate.height,
        candidate.engagement,
        candidate.prompt.is_some(),
    );

    NewImage {
        candidate,
        room_type,
        quality_score,
        scraped_at,
    }
}

pub struct IngestCoordinator {
    store: ImageStore,
    http: Arc<HttpFetcher>,
}

impl IngestCoordinator {
    pub fn new(store: ImageStore, http: Arc<HttpFetcher>) -> Self {
        Self { store, http }
    }

    /// Run one bounded pull against `adapter` and record it as a scrape run.
    ///
    /// The returned run is terminal: `completed` when the source was
    /// exhausted or the limit reached, `failed` when the adapter errored or
    /// `stop` was raised first. Counters accumulated before a failure are
    /// kept. Store errors abort the run without masking the cause.
    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        spec: &SearchSpec,
        stop: &AtomicBool,
    ) -> Result<ScrapeRun, IngestError> {
        let run = self
            .store
            .start_run(adapter.source_id(), spec.query.as_deref(), spec.room_type)
            .await?;
        info!(run = run.id, source = adapter.source_id(), limit = spec.limit, "scrape run started");

        let mut stream = match adapter.open(Arc::clone(&self.http), spec).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(run = run.id, error = %err, "adapter failed to open");
                return Ok(self.store.finish_run(run.id, 0, 0, Some(&err.to_string())).await?);
            }
        };

        let mut images_found = 0i64;
        let mut images_new = 0i64;
        let error = loop {
            if spec.limit > 0 && images_found >= spec.limit as i64 {
                break None;
            }
            if stop.load(Ordering::Relaxed) {
                break Some("stopped before the source was exhausted".to_string());
            }
            match stream.next().await {
                Ok(Some(candidate)) => {
                    let normalized = normalize(candidate, spec.room_type, Utc::now());
                    match self.store.upsert_candidate(&normalized).await {
                        Ok(outcome) => {
                            images_found += 1;
                            if outcome.inserted {
                                images_new += 1;
                            }
                        }
                        // The run row must still reach a terminal state, so
                        // finalize it best-effort before surfacing the error.
                        Err(err) => {
                            warn!(run = run.id, error = %err, "store failed mid-run");
                            if let Err(finish_err) = self
                                .store
                                .finish_run(run.id, images_found, images_new, Some(&err.to_string()))
                                .await
                            {
                                warn!(run = run.id, error = %finish_err, "could not finalize failed run");
                            }
                            return Err(err.into());
                        }
                    }
                }
                Ok(None) => break None,
                Err(err) => {
                    warn!(run = run.id, error = %err, "adapter stream failed");
                    break Some(err.to_string());
                }
            }
        };

        let finished = self
            .store
            .finish_run(run.id, images_found, images_new, error.as_deref())
            .await?;
        info!(
            run = finished.id,
            images_found,
            images_new,
            status = finished.status.as_str(),
            "scrape run finished"
        );
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use roomfeed_adapters::{AdapterError, CandidateStream, SourceKind, VecStream};
    use roomfeed_core::{CurationStatus, RunStatus};
    use roomfeed_storage::HttpClientConfig;

    struct StubAdapter {
        candidates: Vec<RawCandidate>,
        fail_after: Option<usize>,
    }

    struct FailingStream {
        remaining: std::collections::VecDeque<RawCandidate>,
    }

    #[async_trait]
    impl CandidateStream for FailingStream {
        async fn next(&mut self) -> Result<Option<RawCandidate>, AdapterError> {
            match self.remaining.pop_front() {
                Some(candidate) => Ok(Some(candidate)),
                None => Err(AdapterError::Message("upstream hung up".into())),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source_id(&self) -> &str {
            "stub"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Replay
        }

        async fn open(
            &self,
            _http: Arc<HttpFetcher>,
            _spec: &SearchSpec,
        ) -> Result<Box<dyn CandidateStream>, AdapterError> {
            match self.fail_after {
                Some(n) => Ok(Box::new(FailingStream {
                    remaining: self.candidates.iter().take(n).cloned().collect(),
                })),
                None => Ok(Box::new(VecStream::new(self.candidates.clone()))),
            }
        }
    }

    fn coordinator(store: &ImageStore) -> IngestCoordinator {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"));
        IngestCoordinator::new(store.clone(), http)
    }

    fn candidate(source_id: &str, engagement: i64) -> RawCandidate {
        let mut c = RawCandidate::new("stub", source_id, "https://img.example/a.jpg");
        c.title = Some("modern kitchen with oak fronts".into());
        c.engagement = Some(engagement);
        c.width = Some(1200);
        c.height = Some(900);
        c
    }

    #[tokio::test]
    async fn rescrape_refreshes_signals_without_new_rows() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let coordinator = coordinator(&store);
        let stop = AtomicBool::new(false);

        let first_pull = StubAdapter {
            candidates: vec![candidate("1", 10)],
            fail_after: None,
        };
        let second_pull = StubAdapter {
            candidates: vec![candidate("1", 500)],
            fail_after: None,
        };

        let run1 = coordinator.run(&first_pull, &SearchSpec::default(), &stop).await.unwrap();
        let run2 = coordinator.run(&second_pull, &SearchSpec::default(), &stop).await.unwrap();

        assert_eq!(run1.status, RunStatus::Completed);
        assert_eq!((run1.images_found, run1.images_new), (1, 1));
        assert_eq!((run2.images_found, run2.images_new), (1, 0));

        let records = store.list_images(&Default::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].engagement, Some(500));
    }

    #[tokio::test]
    async fn normalization_classifies_and_scores() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let coordinator = coordinator(&store);
        let stop = AtomicBool::new(false);

        let adapter = StubAdapter {
            candidates: vec![candidate("1", 150)],
            fail_after: None,
        };
        coordinator.run(&adapter, &SearchSpec::default(), &stop).await.unwrap();

        let record = &store.list_images(&Default::default()).await.unwrap()[0];
        assert_eq!(record.room_type, Some(RoomType::Kitchen));
        assert_eq!(record.style_tags, vec!["modern".to_string()]);
        // 900px min dimension and engagement 150, no prompt
        assert_eq!(record.quality_score, Some(0.5));
        assert_eq!(record.status, CurationStatus::Pending);
    }

    #[tokio::test]
    async fn limit_bounds_the_pull() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let coordinator = coordinator(&store);
        let stop = AtomicBool::new(false);

        let adapter = StubAdapter {
            candidates: (0..5).map(|i| candidate(&i.to_string(), 0)).collect(),
            fail_after: None,
        };
        let spec = SearchSpec {
            limit: 2,
            ..Default::default()
        };
        let run = coordinator.run(&adapter, &spec, &stop).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.images_found, 2);
    }

    #[tokio::test]
    async fn stop_signal_fails_the_run() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let coordinator = coordinator(&store);
        let stop = AtomicBool::new(true);

        let adapter = StubAdapter {
            candidates: vec![candidate("1", 0)],
            fail_after: None,
        };
        let run = coordinator.run(&adapter, &SearchSpec::default(), &stop).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.images_found, 0);
        assert!(run.error.unwrap().contains("stopped"));
    }

    #[tokio::test]
    async fn store_failure_mid_run_still_finalizes_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomfeed.db");
        let store = ImageStore::open(&path).await.unwrap();

        // Break the images table through a second pool on the same file so
        // the next upsert fails while scrape_runs stays writable.
        let raw = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        sqlx::query("DROP TABLE images").execute(&raw).await.unwrap();

        let coordinator = coordinator(&store);
        let adapter = StubAdapter {
            candidates: vec![candidate("1", 0)],
            fail_after: None,
        };
        let stop = AtomicBool::new(false);
        let err = coordinator.run(&adapter, &SearchSpec::default(), &stop).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));

        let run = store.get_run(1).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert!(run.error.unwrap().contains("database error"));
    }

    #[tokio::test]
    async fn stream_failure_keeps_counters() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let coordinator = coordinator(&store);
        let stop = AtomicBool::new(false);

        let adapter = StubAdapter {
            candidates: vec![candidate("1", 0), candidate("2", 0)],
            fail_after: Some(2),
        };
        let run = coordinator.run(&adapter, &SearchSpec::default(), &stop).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.images_found, 2);
        assert_eq!(run.images_new, 2);
        assert_eq!(run.error.as_deref(), Some("upstream hung up"));
        assert!(run.completed_at.is_some());
    }
}
