//! Hash-addressed image file storage.
//!
//! Files land under `<root>/<source>/<content_hash>.<ext>`, written via a
//! temp file and an atomic rename. Identical bytes always map to the same
//! path, which makes repeated downloads of the same content a no-op.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Normalize a file extension to the image formats we keep; anything
    /// else falls back to jpg.
    pub fn normalize_extension(extension: &str) -> &str {
        let ext = extension.trim_start_matches('.').trim();
        if ALLOWED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)) {
            ext
        } else {
            "jpg"
        }
    }

    pub fn image_relative_path(&self, source: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = Self::normalize_extension(extension);
        PathBuf::from(source).join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably under their content hash.
    pub async fn store_bytes(
        &self,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredImage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.image_relative_path(source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating image directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            return Ok(StoredImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("image path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredImage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp image {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = FileStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn unknown_extensions_fall_back_to_jpg() {
        assert_eq!(FileStore::normalize_extension(".PNG"), "PNG");
        assert_eq!(FileStore::normalize_extension("webp"), "webp");
        assert_eq!(FileStore::normalize_extension(".svg"), "jpg");
        assert_eq!(FileStore::normalize_extension(""), "jpg");
    }

    #[tokio::test]
    async fn identical_bytes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        let first = store.store_bytes("civitai", "jpg", b"same-bytes").await.expect("first");
        let second = store.store_bytes("civitai", "jpg", b"same-bytes").await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.absolute_path, second.absolute_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn sources_get_separate_directories() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        let a = store.store_bytes("civitai", "png", b"bytes").await.expect("a");
        let b = store.store_bytes("lexica", "png", b"bytes").await.expect("b");

        assert_ne!(a.absolute_path, b.absolute_path);
        assert_eq!(a.content_hash, b.content_hash);
    }
}
