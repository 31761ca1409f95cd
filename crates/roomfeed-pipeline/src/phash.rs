//! 64-bit DCT perceptual hash and the in-memory fingerprint index.
//!
//! The pipeline downsamples to a 32x32 grayscale image, takes the 2D DCT,
//! and keeps the 8x8 low-frequency block. Each bit records whether its
//! coefficient sits above the block mean (DC excluded from the mean), so the
//! hash survives resizing, recompression, and uniform brightness shifts.

use std::f64::consts::PI;

use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

const SAMPLE_SIZE: usize = 32;
const BLOCK_SIZE: usize = 8;

/// Distance thresholds that have proven useful in practice.
pub const THRESHOLD_EXACT: u32 = 0;
pub const THRESHOLD_NEAR_EXACT: u32 = 3;
pub const THRESHOLD_SIMILAR: u32 = 8;
pub const THRESHOLD_LOOSE: u32 = 12;
pub const DEFAULT_THRESHOLD: u32 = THRESHOLD_SIMILAR;

/// Hamming distances only go up to the number of hash bits.
pub const MAX_THRESHOLD: u32 = 64;

#[derive(Debug, Error)]
pub enum PhashError {
    #[error("threshold {0} out of range 0..={MAX_THRESHOLD}")]
    InvalidThreshold(u32),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

pub fn validate_threshold(threshold: u32) -> Result<(), PhashError> {
    if threshold > MAX_THRESHOLD {
        return Err(PhashError::InvalidThreshold(threshold));
    }
    Ok(())
}

/// One 64-bit perceptual fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn distance(self, other: Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(text: &str) -> Option<Fingerprint> {
        if text.len() != 16 {
            return None;
        }
        u64::from_str_radix(text, 16).ok().map(Fingerprint)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fingerprint encoded image bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> Result<Fingerprint, PhashError> {
    let decoded = image::load_from_memory(bytes)?;
    Ok(fingerprint_image(&decoded))
}

/// Fingerprint an already-decoded image. Pure and deterministic.
pub fn fingerprint_image(image: &DynamicImage) -> Fingerprint {
    let gray = image
        .resize_exact(SAMPLE_SIZE as u32, SAMPLE_SIZE as u32, FilterType::Triangle)
        .to_luma8();

    let mut pixels = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (y, row) in pixels.iter_mut().enumerate() {
        for (x, value) in row.iter_mut().enumerate() {
            *value = f64::from(gray.get_pixel(x as u32, y as u32)[0]);
        }
    }

    let freq = dct_2d(&pixels);

    let mut block = [0f64; BLOCK_SIZE * BLOCK_SIZE];
    for y in 0..BLOCK_SIZE {
        for x in 0..BLOCK_SIZE {
            block[y * BLOCK_SIZE + x] = freq[y][x];
        }
    }

    // Mean over the block minus the DC term, which would otherwise swamp it.
    let mean = (block.iter().sum::<f64>() - block[0]) / (block.len() - 1) as f64;

    let mut bits = 0u64;
    for coefficient in block {
        bits = (bits << 1) | u64::from(coefficient > mean);
    }
    Fingerprint(bits)
}

fn dct_1d(input: &[f64; SAMPLE_SIZE], output: &mut [f64; SAMPLE_SIZE]) {
    let n = SAMPLE_SIZE as f64;
    for (k, out) in output.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (i, value) in input.iter().enumerate() {
            sum += value * (PI / n * (i as f64 + 0.5) * k as f64).cos();
        }
        *out = sum;
    }
}

fn dct_2d(pixels: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let mut rows = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (row, transformed) in pixels.iter().zip(rows.iter_mut()) {
        dct_1d(row, transformed);
    }

    let mut out = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for x in 0..SAMPLE_SIZE {
        let column: [f64; SAMPLE_SIZE] = std::array::from_fn(|y| rows[y][x]);
        let mut transformed = [0f64; SAMPLE_SIZE];
        dct_1d(&column, &mut transformed);
        for y in 0..SAMPLE_SIZE {
            out[y][x] = transformed[y];
        }
    }
    out
}

/// In-memory fingerprint index. Linear scan; the collection tops out in the
/// tens of thousands, well inside scan territory.
#[derive(Debug, Default)]
pub struct PhashIndex {
    entries: Vec<(i64, Fingerprint)>,
}

impl PhashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode and insert image bytes, returning the computed fingerprint.
    pub fn insert(&mut self, id: i64, bytes: &[u8]) -> Result<Fingerprint, PhashError> {
        let fingerprint = fingerprint_bytes(bytes)?;
        self.insert_fingerprint(id, fingerprint);
        Ok(fingerprint)
    }

    /// Insert a previously computed fingerprint, e.g. when rebuilding the
    /// index from the store.
    pub fn insert_fingerprint(&mut self, id: i64, fingerprint: Fingerprint) {
        self.entries.push((id, fingerprint));
    }

    /// All entries within `threshold`, ordered by distance then id.
    pub fn query(
        &self,
        fingerprint: Fingerprint,
        threshold: u32,
    ) -> Result<Vec<(i64, u32)>, PhashError> {
        validate_threshold(threshold)?;
        let mut hits: Vec<(i64, u32)> = self
            .entries
            .iter()
            .filter_map(|(id, other)| {
                let distance = fingerprint.distance(*other);
                (distance <= threshold).then_some((*id, distance))
            })
            .collect();
        hits.sort_by_key(|&(id, distance)| (distance, id));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(image: RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .expect("png encode");
        out.into_inner()
    }

    fn horizontal_gradient(size: u32, offset: u8) -> RgbImage {
        // Ramp capped at 200 so an offset never clips at 255.
        RgbImage::from_fn(size, size, |x, _| {
            let v = (x * 200 / size) as u8 + offset;
            image::Rgb([v, v, v])
        })
    }

    fn vertical_gradient(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |_, y| {
            let v = (y * 255 / size) as u8;
            image::Rgb([v, v, v])
        })
    }

    #[test]
    fn identical_bytes_hash_identically() {
        let a = fingerprint_bytes(&png(horizontal_gradient(64, 0))).unwrap();
        let b = fingerprint_bytes(&png(horizontal_gradient(64, 0))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.distance(b), 0);
    }

    #[test]
    fn resized_copy_stays_close() {
        let small = fingerprint_bytes(&png(horizontal_gradient(64, 0))).unwrap();
        let large = fingerprint_bytes(&png(horizontal_gradient(256, 0))).unwrap();
        assert!(small.distance(large) <= THRESHOLD_NEAR_EXACT);
    }

    #[test]
    fn uniform_brightness_shift_stays_close() {
        let base = fingerprint_bytes(&png(horizontal_gradient(64, 0))).unwrap();
        let brighter = fingerprint_bytes(&png(horizontal_gradient(64, 40))).unwrap();
        assert!(base.distance(brighter) <= THRESHOLD_NEAR_EXACT);
    }

    #[test]
    fn distinct_structures_hash_apart() {
        let horizontal = fingerprint_bytes(&png(horizontal_gradient(64, 0))).unwrap();
        let vertical = fingerprint_bytes(&png(vertical_gradient(64))).unwrap();
        assert!(horizontal.distance(vertical) > THRESHOLD_SIMILAR);
    }

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint(0xdead_beef_cafe_f00d);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("abc"), None);
        assert_eq!(Fingerprint::from_hex("zzzzzzzzzzzzzzzz"), None);
    }

    #[test]
    fn query_orders_by_distance_then_id() {
        let mut index = PhashIndex::new();
        index.insert_fingerprint(3, Fingerprint(0b0111));
        index.insert_fingerprint(1, Fingerprint(0b0011));
        index.insert_fingerprint(2, Fingerprint(0b0001));
        index.insert_fingerprint(9, Fingerprint(u64::MAX));

        let hits = index.query(Fingerprint(0b0011), 4).unwrap();
        assert_eq!(hits, vec![(1, 0), (2, 1), (3, 1)]);
    }

    #[test]
    fn threshold_above_bit_width_is_rejected() {
        let index = PhashIndex::new();
        let err = index.query(Fingerprint(0), 65).unwrap_err();
        assert!(matches!(err, PhashError::InvalidThreshold(65)));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(fingerprint_bytes(b"not an image").is_err());
    }
}
