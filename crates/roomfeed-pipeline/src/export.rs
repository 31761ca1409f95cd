//! JSON export of curated records for downstream consumers.

use roomfeed_core::{CurationStatus, RoomType};
use roomfeed_storage::{ImageFilter, ImageStore, OrderBy};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportFilters {
    pub status: Option<CurationStatus>,
    pub room_type: Option<RoomType>,
    pub source: Option<String>,
    pub min_quality: Option<f64>,
}

impl ExportFilters {
    /// The common case: everything a curator has approved.
    pub fn approved() -> Self {
        Self {
            status: Some(CurationStatus::Approved),
            ..Default::default()
        }
    }

    fn to_image_filter(&self) -> ImageFilter {
        ImageFilter {
            source: self.source.clone(),
            room_type: self.room_type,
            status: self.status,
            min_quality: self.min_quality,
            order_by: OrderBy::QualityDesc,
            limit: None,
            offset: 0,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportDocument<'a> {
    count: usize,
    filters: &'a ExportFilters,
    images: &'a [roomfeed_core::ImageRecord],
}

/// Render matching records as a pretty-printed JSON document of the shape
/// `{count, filters, images}`.
pub async fn export_json(store: &ImageStore, filters: &ExportFilters) -> anyhow::Result<String> {
    let images = store.list_images(&filters.to_image_filter()).await?;
    let document = ExportDocument {
        count: images.len(),
        filters,
        images: &images,
    };
    Ok(serde_json::to_string_pretty(&document)?)
}
