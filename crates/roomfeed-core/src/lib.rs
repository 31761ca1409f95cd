//! Core domain model for the Roomfeed ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "roomfeed-core";

/// Closed set of room types a record can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    LivingRoom,
    Kitchen,
    Bedroom,
    Bathroom,
    Hallway,
    Dining,
    Office,
    Outdoor,
    Other,
}

impl RoomType {
    pub const ALL: [RoomType; 9] = [
        RoomType::LivingRoom,
        RoomType::Kitchen,
        RoomType::Bedroom,
        RoomType::Bathroom,
        RoomType::Hallway,
        RoomType::Dining,
        RoomType::Office,
        RoomType::Outdoor,
        RoomType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::LivingRoom => "living_room",
            RoomType::Kitchen => "kitchen",
            RoomType::Bedroom => "bedroom",
            RoomType::Bathroom => "bathroom",
            RoomType::Hallway => "hallway",
            RoomType::Dining => "dining",
            RoomType::Office => "office",
            RoomType::Outdoor => "outdoor",
            RoomType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<RoomType> {
        Self::ALL.iter().copied().find(|r| r.as_str() == value)
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Curation lifecycle: pending until a curator approves or rejects.
/// Terminal states stay re-openable via an explicit reset to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurationStatus {
    Pending,
    Approved,
    Rejected,
}

impl CurationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurationStatus::Pending => "pending",
            CurationStatus::Approved => "approved",
            CurationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<CurationStatus> {
        match value {
            "pending" => Some(CurationStatus::Pending),
            "approved" => Some(CurationStatus::Approved),
            "rejected" => Some(CurationStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for CurationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scrape run lifecycle. A run transitions exactly once out of `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<RunStatus> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted image record, the central entity of the pipeline.
///
/// `(source, source_id)` is the natural key; `id` is the surrogate key
/// assigned at first persistence and never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub local_path: Option<String>,
    pub content_hash: Option<String>,
    pub phash: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub room_type: Option<RoomType>,
    pub style_tags: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality_score: Option<f64>,
    pub engagement: Option<i64>,
    pub status: CurationStatus,
    pub notes: Option<String>,
    pub curated_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Pixel area used as a resolution tiebreaker in survivor ranking.
    pub fn pixel_area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }
}

/// Normalized candidate produced by a source adapter, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub room_type: Option<RoomType>,
    pub style_tags: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub engagement: Option<i64>,
}

impl RawCandidate {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
            source_url: None,
            image_url: image_url.into(),
            thumbnail_url: None,
            title: None,
            description: None,
            prompt: None,
            room_type: None,
            style_tags: Vec::new(),
            width: None,
            height: None,
            engagement: None,
        }
    }

    /// Text blob used for keyword classification.
    pub fn classification_text(&self) -> String {
        [&self.title, &self.description, &self.prompt]
            .into_iter()
            .filter_map(|f| f.as_deref())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Audit record for one bounded adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: i64,
    pub source: String,
    pub query: Option<String>,
    pub room_type: Option<RoomType>,
    pub images_found: i64,
    pub images_new: i64,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Output of the opaque visual classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub room_type: RoomType,
    pub confidence: f64,
    pub style_tags: Vec<String>,
}

/// Keyword table for text-based room classification. Includes the
/// Norwegian/Swedish/German/French terms the sources routinely surface.
const ROOM_KEYWORDS: &[(RoomType, &[&str])] = &[
    (
        RoomType::LivingRoom,
        &[
            "living room", "living-room", "lounge", "family room", "sitting room",
            "stue", "vardagsrum", "wohnzimmer", "salon",
        ],
    ),
    (
        RoomType::Kitchen,
        &[
            "kitchen", "kitchenette", "cooking", "culinary",
            "kjøkken", "kök", "küche", "cuisine",
        ],
    ),
    (
        RoomType::Bedroom,
        &[
            "bedroom", "bed room", "master bedroom", "guest room", "sleeping",
            "soverom", "sovrum", "schlafzimmer", "chambre",
        ],
    ),
    (
        RoomType::Bathroom,
        &[
            "bathroom", "bath room", "toilet", "wc", "shower", "ensuite",
            "bad", "badrum", "badezimmer", "salle de bain",
        ],
    ),
    (
        RoomType::Hallway,
        &[
            "hallway", "hall", "corridor", "entrance", "entryway", "foyer", "mudroom",
            "gang", "flur", "entrée",
        ],
    ),
    (
        RoomType::Dining,
        &[
            "dining room", "dining-room", "dining area", "breakfast nook",
            "spisestue", "matsal", "esszimmer", "salle à manger",
        ],
    ),
    (
        RoomType::Office,
        &[
            "office", "home office", "study", "workspace", "work from home", "desk",
            "kontor", "hemmakontor", "büro", "bureau",
        ],
    ),
    (
        RoomType::Outdoor,
        &[
            "outdoor", "patio", "terrace", "balcony", "garden", "deck", "veranda",
            "uteplass", "terrasse", "balkong", "hage",
        ],
    ),
];

/// Style vocabulary recognized in prompts and descriptions.
pub const STYLE_KEYWORDS: &[&str] = &[
    "scandinavian",
    "modern",
    "minimalist",
    "industrial",
    "bohemian",
    "traditional",
    "rustic",
    "japandi",
    "mid-century",
    "coastal",
];

/// Classify room type from free text (title, description, prompt).
///
/// Returns `None` for empty text, `Other` for non-empty text with no
/// keyword hit, so callers can distinguish "nothing to classify" from
/// "classified but unrecognized".
pub fn classify_room_type(text: &str) -> Option<RoomType> {
    if text.trim().is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    for (room, keywords) in ROOM_KEYWORDS {
        if keywords.iter().any(|k| lower.contains(k)) {
            return Some(*room);
        }
    }
    Some(RoomType::Other)
}

/// Extract style tags from free text against the style vocabulary,
/// preserving vocabulary order and skipping duplicates.
pub fn extract_style_tags(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    STYLE_KEYWORDS
        .iter()
        .filter(|style| lower.contains(*style))
        .map(|s| (*s).to_string())
        .collect()
}

/// Compute a quality score in [0, 1] from resolution, engagement, and
/// whether the record carries a generation prompt. Bucketed rather than
/// continuous so re-scrapes with jittery engagement stay stable.
pub fn compute_quality_score(
    width: Option<u32>,
    height: Option<u32>,
    engagement: Option<i64>,
    has_prompt: bool,
) -> f64 {
    let mut score: f64 = 0.0;

    let min_dim = width.unwrap_or(0).min(height.unwrap_or(0));
    score += match min_dim {
        d if d >= 1080 => 0.4,
        d if d >= 720 => 0.3,
        d if d >= 480 => 0.2,
        d if d > 0 => 0.1,
        _ => 0.0,
    };

    let engagement = engagement.unwrap_or(0);
    score += match engagement {
        e if e >= 1000 => 0.4,
        e if e >= 500 => 0.3,
        e if e >= 100 => 0.2,
        e if e >= 10 => 0.1,
        _ => 0.0,
    };

    if has_prompt {
        score += 0.2;
    }

    (score * 100.0).round() / 100.0
}
