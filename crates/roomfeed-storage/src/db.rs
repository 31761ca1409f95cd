//! SQLite-backed image and scrape-run store.
//!
//! Natural-key upserts go through `INSERT OR IGNORE` + targeted `UPDATE`,
//! so concurrent runs hitting the same `(source, source_id)` are serialized
//! by the database rather than by callers.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use roomfeed_core::{CurationStatus, ImageRecord, RawCandidate, RoomType, RunStatus, ScrapeRun};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("image {0} not found")]
    NotFound(i64),
    #[error("scrape run {0} is not running")]
    RunFinished(i64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Candidate plus the fields the ingestion coordinator derives before
/// persistence.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub candidate: RawCandidate,
    pub room_type: Option<RoomType>,
    pub quality_score: f64,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    ScrapedAtDesc,
    QualityDesc,
    EngagementDesc,
    RoomThenQuality,
}

impl OrderBy {
    fn sql(self) -> &'static str {
        match self {
            OrderBy::ScrapedAtDesc => "scraped_at DESC",
            OrderBy::QualityDesc => "quality_score DESC",
            OrderBy::EngagementDesc => "engagement DESC",
            OrderBy::RoomThenQuality => "room_type, quality_score DESC",
        }
    }
}

/// Filter for the collaborator-facing image listing.
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub source: Option<String>,
    pub room_type: Option<RoomType>,
    pub status: Option<CurationStatus>,
    pub min_quality: Option<f64>,
    pub order_by: OrderBy,
    pub limit: Option<i64>,
    pub offset: i64,
}

/// Filter for selecting records that need a download pass.
#[derive(Debug, Clone, Default)]
pub struct DownloadFilter {
    pub status: Option<CurationStatus>,
    pub room_type: Option<RoomType>,
    pub source: Option<String>,
    pub only_missing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total: i64,
    pub by_source: BTreeMap<String, i64>,
    pub by_room_type: BTreeMap<String, i64>,
    pub by_status: BTreeMap<String, i64>,
    pub downloaded: i64,
    pub approved: i64,
    pub approved_downloaded: i64,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    pool: SqlitePool,
}

const IMAGES_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    source_id TEXT NOT NULL,
    source_url TEXT,
    image_url TEXT NOT NULL,
    thumbnail_url TEXT,
    local_path TEXT,
    content_hash TEXT,
    phash TEXT,
    title TEXT,
    description TEXT,
    prompt TEXT,
    room_type TEXT,
    style_tags TEXT,
    width INTEGER,
    height INTEGER,
    quality_score REAL,
    engagement INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    notes TEXT,
    curated_at TIMESTAMP,
    scraped_at TIMESTAMP NOT NULL,
    created_at TIMESTAMP NOT NULL,
    UNIQUE(source, source_id)
)";

const SCRAPE_RUNS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS scrape_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    query TEXT,
    room_type TEXT,
    images_found INTEGER NOT NULL DEFAULT 0,
    images_new INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running',
    error TEXT,
    started_at TIMESTAMP NOT NULL,
    completed_at TIMESTAMP
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_images_source ON images(source)",
    "CREATE INDEX IF NOT EXISTS idx_images_room_type ON images(room_type)",
    "CREATE INDEX IF NOT EXISTS idx_images_status ON images(status)",
    "CREATE INDEX IF NOT EXISTS idx_images_quality ON images(quality_score DESC)",
    "CREATE INDEX IF NOT EXISTS idx_images_engagement ON images(engagement DESC)",
    "CREATE INDEX IF NOT EXISTS idx_runs_source ON scrape_runs(source)",
];

impl ImageStore {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema exists. Safe to call repeatedly.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let newly_created = !path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("creating {}: {e}", parent.display())))?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        // WAL keeps readers unblocked while download workers write.
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.init_schema().await?;

        if newly_created {
            info!(path = %path.display(), "initialized new database");
        }
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(IMAGES_TABLE).execute(&self.pool).await?;
        sqlx::query(SCRAPE_RUNS_TABLE).execute(&self.pool).await?;
        for index in INDEXES {
            sqlx::query(index).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert-if-absent on the natural key, else refresh mutable signals.
    ///
    /// Identity fields, curation fields and both timestamps are never
    /// touched on the update path, so a re-scrape cannot regress `status`
    /// or `curated_at`.
    pub async fn upsert_candidate(&self, new: &NewImage) -> Result<UpsertOutcome, StoreError> {
        let c = &new.candidate;
        let style_tags = encode_style_tags(&c.style_tags);
        let created_at = Utc::now();

        let result = sqlx::query(
            "INSERT OR IGNORE INTO images \
             (source, source_id, source_url, image_url, thumbnail_url, title, description, \
              prompt, room_type, style_tags, width, height, quality_score, engagement, \
              status, scraped_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&c.source)
        .bind(&c.source_id)
        .bind(&c.source_url)
        .bind(&c.image_url)
        .bind(&c.thumbnail_url)
        .bind(&c.title)
        .bind(&c.description)
        .bind(&c.prompt)
        .bind(new.room_type.map(|r| r.as_str()))
        .bind(&style_tags)
        .bind(c.width.map(i64::from))
        .bind(c.height.map(i64::from))
        .bind(new.quality_score)
        .bind(c.engagement)
        .bind(new.scraped_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(UpsertOutcome {
                id: result.last_insert_rowid(),
                inserted: true,
            });
        }

        let row = sqlx::query(
            "UPDATE images SET \
               engagement = COALESCE(?, engagement), \
               quality_score = ?, \
               width = COALESCE(?, width), \
               height = COALESCE(?, height), \
               title = COALESCE(?, title), \
               description = COALESCE(?, description), \
               prompt = COALESCE(?, prompt), \
               thumbnail_url = COALESCE(?, thumbnail_url) \
             WHERE source = ? AND source_id = ? \
             RETURNING id",
        )
        .bind(c.engagement)
        .bind(new.quality_score)
        .bind(c.width.map(i64::from))
        .bind(c.height.map(i64::from))
        .bind(&c.title)
        .bind(&c.description)
        .bind(&c.prompt)
        .bind(&c.thumbnail_url)
        .bind(&c.source)
        .bind(&c.source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            id: row.try_get("id")?,
            inserted: false,
        })
    }

    pub async fn get_image(&self, id: i64) -> Result<ImageRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_image(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub async fn get_images_by_ids(&self, ids: &[i64]) -> Result<Vec<ImageRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM images WHERE id IN ({placeholders}) ORDER BY id");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_image).collect()
    }

    pub async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>, StoreError> {
        let mut sql = String::from("SELECT * FROM images");
        let mut conditions = Vec::new();
        if filter.source.is_some() {
            conditions.push("source = ?");
        }
        if filter.room_type.is_some() {
            conditions.push("room_type = ?");
        }
        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        if filter.min_quality.is_some() {
            conditions.push("quality_score >= ?");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(filter.order_by.sql());
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(source) = &filter.source {
            query = query.bind(source);
        }
        if let Some(room) = filter.room_type {
            query = query.bind(room.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(min_quality) = filter.min_quality {
            query = query.bind(min_quality);
        }
        query = query.bind(filter.limit.unwrap_or(i64::MAX)).bind(filter.offset);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_image).collect()
    }

    /// Records eligible for a download pass, best quality first.
    pub async fn images_for_download(
        &self,
        filter: &DownloadFilter,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let mut sql = String::from("SELECT * FROM images");
        let mut conditions = Vec::new();
        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        if filter.room_type.is_some() {
            conditions.push("room_type = ?");
        }
        if filter.source.is_some() {
            conditions.push("source = ?");
        }
        if filter.only_missing {
            conditions.push("(local_path IS NULL OR local_path = '')");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY quality_score DESC, id");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(room) = filter.room_type {
            query = query.bind(room.as_str());
        }
        if let Some(source) = &filter.source {
            query = query.bind(source);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_image).collect()
    }

    /// Record a successful download: local path, content hash, and any
    /// dimensions decoded from the bytes.
    pub async fn set_local_file(
        &self,
        id: i64,
        local_path: &str,
        content_hash: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE images SET local_path = ?, content_hash = ?, \
             width = COALESCE(?, width), height = COALESCE(?, height) WHERE id = ?",
        )
        .bind(local_path)
        .bind(content_hash)
        .bind(width.map(i64::from))
        .bind(height.map(i64::from))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    pub async fn set_fingerprint(&self, id: i64, phash: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE images SET phash = ? WHERE id = ?")
            .bind(phash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// All stored fingerprints, for rebuilding the in-memory index.
    pub async fn fingerprints(&self) -> Result<Vec<(i64, String)>, StoreError> {
        let rows = sqlx::query("SELECT id, phash FROM images WHERE phash IS NOT NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("phash")?)))
            .collect()
    }

    /// Downloaded records that still need a fingerprint computed.
    pub async fn images_missing_fingerprint(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM images \
             WHERE phash IS NULL AND local_path IS NOT NULL AND local_path != '' \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_image).collect()
    }

    pub async fn set_classification(
        &self,
        id: i64,
        room_type: RoomType,
        style_tags: &[String],
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE images SET room_type = ?, style_tags = ? WHERE id = ?")
            .bind(room_type.as_str())
            .bind(encode_style_tags(style_tags))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Curation transition. Every call stamps `curated_at`, including a
    /// pending re-affirmation and a re-open from a terminal state. Notes
    /// are overwritten only when provided.
    pub async fn set_status(
        &self,
        id: i64,
        status: CurationStatus,
        notes: Option<&str>,
    ) -> Result<ImageRecord, StoreError> {
        let result = sqlx::query(
            "UPDATE images SET status = ?, curated_at = ?, notes = COALESCE(?, notes) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.get_image(id).await
    }

    pub async fn start_run(
        &self,
        source: &str,
        query: Option<&str>,
        room_type: Option<RoomType>,
    ) -> Result<ScrapeRun, StoreError> {
        let started_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO scrape_runs (source, query, room_type, status, started_at) \
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(source)
        .bind(query)
        .bind(room_type.map(|r| r.as_str()))
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        self.get_run(result.last_insert_rowid()).await
    }

    /// Terminal transition for a run. Counters accumulated so far are
    /// persisted whether the run completed or failed. A run that already
    /// reached a terminal state is never revisited.
    pub async fn finish_run(
        &self,
        run_id: i64,
        images_found: i64,
        images_new: i64,
        error: Option<&str>,
    ) -> Result<ScrapeRun, StoreError> {
        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let result = sqlx::query(
            "UPDATE scrape_runs \
             SET images_found = ?, images_new = ?, status = ?, error = ?, completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(images_found)
        .bind(images_new)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunFinished(run_id));
        }
        self.get_run(run_id).await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<ScrapeRun, StoreError> {
        let row = sqlx::query("SELECT * FROM scrape_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_run(&row),
            None => Err(StoreError::NotFound(run_id)),
        }
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();

        let row = sqlx::query("SELECT COUNT(*) AS n FROM images")
            .fetch_one(&self.pool)
            .await?;
        stats.total = row.try_get("n")?;

        for row in sqlx::query("SELECT source, COUNT(*) AS n FROM images GROUP BY source")
            .fetch_all(&self.pool)
            .await?
        {
            stats.by_source.insert(row.try_get("source")?, row.try_get("n")?);
        }
        for row in sqlx::query(
            "SELECT room_type, COUNT(*) AS n FROM images \
             WHERE room_type IS NOT NULL GROUP BY room_type",
        )
        .fetch_all(&self.pool)
        .await?
        {
            stats
                .by_room_type
                .insert(row.try_get("room_type")?, row.try_get("n")?);
        }
        for row in sqlx::query("SELECT status, COUNT(*) AS n FROM images GROUP BY status")
            .fetch_all(&self.pool)
            .await?
        {
            stats.by_status.insert(row.try_get("status")?, row.try_get("n")?);
        }

        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM images WHERE local_path IS NOT NULL AND local_path != ''",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.downloaded = row.try_get("n")?;

        let row = sqlx::query("SELECT COUNT(*) AS n FROM images WHERE status = 'approved'")
            .fetch_one(&self.pool)
            .await?;
        stats.approved = row.try_get("n")?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM images \
             WHERE status = 'approved' AND local_path IS NOT NULL AND local_path != ''",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.approved_downloaded = row.try_get("n")?;

        Ok(stats)
    }
}

fn encode_style_tags(tags: &[String]) -> Option<String> {
    if tags.is_empty() {
        None
    } else {
        serde_json::to_string(tags).ok()
    }
}

fn decode_style_tags(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn row_to_image(row: &SqliteRow) -> Result<ImageRecord, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = CurationStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status_text:?}")))?;
    let room_type = row
        .try_get::<Option<String>, _>("room_type")?
        .map(|text| {
            RoomType::parse(&text)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown room_type {text:?}")))
        })
        .transpose()?;

    Ok(ImageRecord {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        source_url: row.try_get("source_url")?,
        image_url: row.try_get("image_url")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        local_path: row.try_get("local_path")?,
        content_hash: row.try_get("content_hash")?,
        phash: row.try_get("phash")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        prompt: row.try_get("prompt")?,
        room_type,
        style_tags: decode_style_tags(row.try_get("style_tags")?),
        width: row.try_get::<Option<i64>, _>("width")?.map(|w| w as u32),
        height: row.try_get::<Option<i64>, _>("height")?.map(|h| h as u32),
        quality_score: row.try_get("quality_score")?,
        engagement: row.try_get("engagement")?,
        status,
        notes: row.try_get("notes")?,
        curated_at: row.try_get("curated_at")?,
        scraped_at: row.try_get("scraped_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_run(row: &SqliteRow) -> Result<ScrapeRun, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown run status {status_text:?}")))?;
    let room_type = row
        .try_get::<Option<String>, _>("room_type")?
        .map(|text| {
            RoomType::parse(&text)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown room_type {text:?}")))
        })
        .transpose()?;

    Ok(ScrapeRun {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        query: row.try_get("query")?,
        room_type,
        images_found: row.try_get("images_found")?,
        images_new: row.try_get("images_new")?,
        status,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
