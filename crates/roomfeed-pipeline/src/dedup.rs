//! Duplicate grouping over stored fingerprints.
//!
//! Groups are the connected components of the "within threshold" relation,
//! so near-duplicate chains collapse into one group even when the endpoints
//! sit further apart than the threshold. One survivor is kept per group and
//! the rest are rejected with a pointer back to it; nothing is deleted.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use roomfeed_core::{CurationStatus, ImageRecord};
use roomfeed_storage::{ImageStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::phash::{self, Fingerprint, PhashError, PhashIndex};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error(transparent)]
    Phash(#[from] PhashError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub survivor: ImageRecord,
    pub duplicates: Vec<ImageRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub groups: usize,
    pub marked: usize,
}

/// Disjoint-set forest with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cursor = index;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Survivor ordering: best quality first, then engagement, then pixel area,
/// then the oldest record, then the smallest id.
pub fn survivor_order(a: &ImageRecord, b: &ImageRecord) -> Ordering {
    let quality_a = a.quality_score.unwrap_or(0.0);
    let quality_b = b.quality_score.unwrap_or(0.0);
    quality_b
        .partial_cmp(&quality_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.engagement.unwrap_or(0).cmp(&a.engagement.unwrap_or(0)))
        .then_with(|| b.pixel_area().cmp(&a.pixel_area()))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub struct DedupEngine {
    store: ImageStore,
}

impl DedupEngine {
    pub fn new(store: ImageStore) -> Self {
        Self { store }
    }

    /// Compute fingerprints for downloaded records that lack one. Unreadable
    /// or undecodable files are logged and skipped.
    pub async fn fingerprint_missing(&self) -> Result<usize, DedupError> {
        let records = self.store.images_missing_fingerprint().await?;
        let mut computed = 0;
        for record in records {
            let Some(path) = record.local_path.as_deref() else {
                continue;
            };
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(id = record.id, path, error = %err, "skipping unreadable local file");
                    continue;
                }
            };
            match phash::fingerprint_bytes(&bytes) {
                Ok(fingerprint) => {
                    self.store.set_fingerprint(record.id, &fingerprint.to_hex()).await?;
                    computed += 1;
                }
                Err(err) => {
                    warn!(id = record.id, path, error = %err, "skipping undecodable image");
                }
            }
        }
        info!(computed, "fingerprint pass finished");
        Ok(computed)
    }

    /// Group stored fingerprints by transitive distance. Read-only; callers
    /// wanting a dry run use this directly.
    pub async fn find_groups(&self, threshold: u32) -> Result<Vec<DuplicateGroup>, DedupError> {
        phash::validate_threshold(threshold)?;

        let mut fingerprints = Vec::new();
        for (id, hex) in self.store.fingerprints().await? {
            match Fingerprint::from_hex(&hex) {
                Some(fingerprint) => fingerprints.push((id, fingerprint)),
                None => warn!(id, hex, "skipping malformed fingerprint"),
            }
        }

        let mut forest = UnionFind::new(fingerprints.len());
        for i in 0..fingerprints.len() {
            for j in (i + 1)..fingerprints.len() {
                if fingerprints[i].1.distance(fingerprints[j].1) <= threshold {
                    forest.union(i, j);
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
        for (index, (id, _)) in fingerprints.iter().enumerate() {
            clusters.entry(forest.find(index)).or_default().push(*id);
        }

        let mut groups = Vec::new();
        for ids in clusters.into_values().filter(|ids| ids.len() > 1) {
            let mut records = self.store.get_images_by_ids(&ids).await?;
            records.sort_by(survivor_order);
            let survivor = records.remove(0);
            groups.push(DuplicateGroup {
                survivor,
                duplicates: records,
            });
        }
        groups.sort_by_key(|group| group.survivor.id);
        Ok(groups)
    }

    /// Same grouping as `mark_duplicates`, with zero writes.
    pub async fn dry_run(&self, threshold: u32) -> Result<Vec<DuplicateGroup>, DedupError> {
        self.find_groups(threshold).await
    }

    /// Reject every non-survivor with a note naming its survivor. Records
    /// already rejected are left alone so curator notes survive re-runs.
    pub async fn mark_duplicates(
        &self,
        threshold: u32,
    ) -> Result<(Vec<DuplicateGroup>, DedupReport), DedupError> {
        let groups = self.find_groups(threshold).await?;
        let mut marked = 0;
        for group in &groups {
            for duplicate in &group.duplicates {
                if duplicate.status == CurationStatus::Rejected {
                    continue;
                }
                let note = format!("Duplicate of image {}", group.survivor.id);
                self.store
                    .set_status(duplicate.id, CurationStatus::Rejected, Some(&note))
                    .await?;
                marked += 1;
            }
        }
        info!(groups = groups.len(), marked, threshold, "duplicate marking finished");
        let report = DedupReport {
            groups: groups.len(),
            marked,
        };
        Ok((groups, report))
    }

    /// Would these bytes duplicate anything already fingerprinted?
    pub async fn is_duplicate(
        &self,
        bytes: &[u8],
        threshold: u32,
    ) -> Result<(bool, Vec<i64>), DedupError> {
        phash::validate_threshold(threshold)?;
        let fingerprint = phash::fingerprint_bytes(bytes)?;

        let mut index = PhashIndex::new();
        for (id, hex) in self.store.fingerprints().await? {
            if let Some(stored) = Fingerprint::from_hex(&hex) {
                index.insert_fingerprint(id, stored);
            }
        }
        let ids: Vec<i64> = index
            .query(fingerprint, threshold)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        Ok((!ids.is_empty(), ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roomfeed_core::{RawCandidate, RoomType};
    use roomfeed_storage::NewImage;

    async fn seed(
        store: &ImageStore,
        source_id: &str,
        width: u32,
        height: u32,
        engagement: i64,
        fingerprint: Fingerprint,
    ) -> i64 {
        let mut candidate = RawCandidate::new("civitai", source_id, "https://img.example/x.jpg");
        candidate.width = Some(width);
        candidate.height = Some(height);
        candidate.engagement = Some(engagement);
        let outcome = store
            .upsert_candidate(&NewImage {
                candidate,
                room_type: Some(RoomType::LivingRoom),
                quality_score: 0.5,
                scraped_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .set_fingerprint(outcome.id, &fingerprint.to_hex())
            .await
            .unwrap();
        outcome.id
    }

    // a..b and b..c are 6 bits apart on disjoint bit ranges, so a..c is 12.
    const FP_A: Fingerprint = Fingerprint(0);
    const FP_B: Fingerprint = Fingerprint(0x3f);
    const FP_C: Fingerprint = Fingerprint(0x3f | (0x3f << 6));
    const FP_FAR: Fingerprint = Fingerprint(u64::MAX);

    #[tokio::test]
    async fn chained_neighbors_group_transitively() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let a = seed(&store, "a", 1000, 1000, 0, FP_A).await;
        let b = seed(&store, "b", 1000, 1000, 0, FP_B).await;
        let c = seed(&store, "c", 1000, 1000, 0, FP_C).await;
        seed(&store, "far", 1000, 1000, 0, FP_FAR).await;

        let engine = DedupEngine::new(store);
        let groups = engine.find_groups(8).await.unwrap();
        assert_eq!(groups.len(), 1);

        let mut members: Vec<i64> = std::iter::once(groups[0].survivor.id)
            .chain(groups[0].duplicates.iter().map(|r| r.id))
            .collect();
        members.sort_unstable();
        assert_eq!(members, vec![a, b, c]);
    }

    fn member_sets(groups: &[DuplicateGroup]) -> Vec<std::collections::BTreeSet<i64>> {
        groups
            .iter()
            .map(|group| {
                std::iter::once(group.survivor.id)
                    .chain(group.duplicates.iter().map(|r| r.id))
                    .collect()
            })
            .collect()
    }

    #[tokio::test]
    async fn lower_threshold_refines_groups() {
        let store = ImageStore::open_in_memory().await.unwrap();
        seed(&store, "a", 1000, 1000, 0, FP_A).await;
        seed(&store, "b", 1000, 1000, 0, FP_B).await;
        seed(&store, "c", 1000, 1000, 0, FP_C).await;
        // a second cluster two bits apart, far from the first
        seed(&store, "d", 1000, 1000, 0, FP_FAR).await;
        seed(&store, "e", 1000, 1000, 0, Fingerprint(u64::MAX ^ 0b11)).await;

        let engine = DedupEngine::new(store);
        let loose = engine.find_groups(8).await.unwrap();
        let tight = engine.find_groups(4).await.unwrap();
        assert_eq!(loose.len(), 2);
        assert_eq!(tight.len(), 1);

        // every group under the stricter threshold is contained in some
        // group under the looser one
        let loose_sets = member_sets(&loose);
        for tight_set in member_sets(&tight) {
            assert!(loose_sets.iter().any(|loose_set| tight_set.is_subset(loose_set)));
        }

        // below every pairwise distance, nothing groups at all
        assert!(engine.find_groups(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survivor_prefers_resolution_then_age() {
        let store = ImageStore::open_in_memory().await.unwrap();
        // same quality bucket and engagement, larger pixel area wins
        let small = seed(&store, "small", 1920, 1080, 10, FP_A).await;
        let large = seed(&store, "large", 3840, 2160, 10, FP_B).await;

        let engine = DedupEngine::new(store.clone());
        let groups = engine.find_groups(8).await.unwrap();
        assert_eq!(groups[0].survivor.id, large);
        assert_eq!(groups[0].duplicates[0].id, small);

        // identical signals: the earlier record survives
        let older = seed(&store, "older", 1000, 1000, 5, FP_FAR).await;
        let newer = seed(&store, "newer", 1000, 1000, 5, Fingerprint(u64::MAX ^ 1)).await;
        let groups = engine.find_groups(8).await.unwrap();
        let tie_group = groups
            .iter()
            .find(|g| g.survivor.id == older || g.survivor.id == newer)
            .unwrap();
        assert_eq!(tie_group.survivor.id, older);
    }

    #[tokio::test]
    async fn marking_matches_dry_run_and_skips_rejected() {
        let store = ImageStore::open_in_memory().await.unwrap();
        seed(&store, "a", 1000, 1000, 100, FP_A).await;
        let b = seed(&store, "b", 800, 800, 0, FP_B).await;

        let engine = DedupEngine::new(store.clone());
        let dry = engine.find_groups(8).await.unwrap();
        let (marked_groups, report) = engine.mark_duplicates(8).await.unwrap();

        assert_eq!(dry.len(), marked_groups.len());
        assert_eq!(dry[0].survivor.id, marked_groups[0].survivor.id);
        assert_eq!(report, DedupReport { groups: 1, marked: 1 });

        let rejected = store.get_image(b).await.unwrap();
        assert_eq!(rejected.status, CurationStatus::Rejected);
        assert!(rejected.notes.unwrap().starts_with("Duplicate of image"));

        // already-rejected records are not re-marked
        let (_, second) = engine.mark_duplicates(8).await.unwrap();
        assert_eq!(second.marked, 0);
    }

    #[tokio::test]
    async fn invalid_threshold_is_rejected_before_any_work() {
        let store = ImageStore::open_in_memory().await.unwrap();
        let engine = DedupEngine::new(store);
        let err = engine.find_groups(65).await.unwrap_err();
        assert!(matches!(err, DedupError::Phash(PhashError::InvalidThreshold(65))));
    }

    #[tokio::test]
    async fn is_duplicate_reports_matching_ids() {
        use image::{DynamicImage, ImageFormat, RgbImage};
        use std::io::Cursor;

        let gradient = RgbImage::from_fn(64, 64, |x, _| {
            let v = (x * 255 / 64) as u8;
            image::Rgb([v, v, v])
        });
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(gradient)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        let bytes = bytes.into_inner();

        let store = ImageStore::open_in_memory().await.unwrap();
        let fingerprint = phash::fingerprint_bytes(&bytes).unwrap();
        let id = seed(&store, "a", 64, 64, 0, fingerprint).await;

        let engine = DedupEngine::new(store);
        let (hit, ids) = engine.is_duplicate(&bytes, 0).await.unwrap();
        assert!(hit);
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn union_find_compresses_paths() {
        let mut forest = UnionFind::new(5);
        forest.union(0, 1);
        forest.union(1, 2);
        forest.union(3, 4);
        assert_eq!(forest.find(0), forest.find(2));
        assert_ne!(forest.find(2), forest.find(4));
    }
}
