//! Opaque log-upload storage for `POST /nest/upload`. Grounded on the
//! reference server's `blob_storage.rs` client shape (`store_blob`/
//! `get_blob`/`delete_blob`, UUID-derived keys, the same tracing fields),
//! backed by a configured local directory rather than an S3-compatible
//! bucket — this service has no object-storage dependency in its stack.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    pub base_dir: PathBuf,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::var("UPLOAD_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/uploads")),
        }
    }
}

pub struct BlobStore {
    base_dir: PathBuf,
}

impl BlobStore {
    pub async fn new(config: BlobStoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_dir)
            .await
            .with_context(|| format!("failed to create blob directory {:?}", config.base_dir))?;

        Ok(Self {
            base_dir: config.base_dir,
        })
    }

    fn path_for(&self, blob_id: &str) -> PathBuf {
        self.base_dir.join(blob_id)
    }

    pub async fn store_blob(&self, blob_id: &str, data: Vec<u8>) -> Result<String> {
        let path = self.path_for(blob_id);
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("failed to write blob {blob_id}"))?;

        info!(blob_id = %blob_id, size = data.len(), "stored upload blob");
        Ok(blob_id.to_string())
    }

    pub async fn get_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(blob_id);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob {blob_id}"))?;

        info!(blob_id = %blob_id, size = data.len(), "retrieved upload blob");
        Ok(data)
    }

    pub async fn delete_blob(&self, blob_id: &str) -> Result<()> {
        let path = self.path_for(blob_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(blob_id = %blob_id, error = %e, "failed to delete blob");
                return Err(e).context("failed to delete blob");
            }
        }
        Ok(())
    }
}

/// Derives a filesystem-safe filename from the upload request's declared
/// filename (if any) and a fresh identifier, so two concurrent uploads with
/// the same client-supplied name never collide.
pub fn derive_blob_filename(declared_name: Option<&str>, upload_id: &str) -> String {
    let sanitized = declared_name
        .map(sanitize_filename_component)
        .filter(|s| !s.is_empty());

    match sanitized {
        Some(name) => format!("{upload_id}-{name}"),
        None => upload_id.to_string(),
    }
}

fn sanitize_filename_component(name: &str) -> String {
    let candidate: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-' || *c == '_')
        .take(128)
        .collect();

    // Strip path traversal segments; a sanitized name should never contain `..`.
    candidate.replace("..", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_name_from_declared_filename() {
        let name = derive_blob_filename(Some("debug-log.txt"), "upload-1");
        assert_eq!(name, "upload-1-debug-log.txt");
    }

    #[test]
    fn falls_back_to_upload_id_when_no_filename() {
        let name = derive_blob_filename(None, "upload-1");
        assert_eq!(name, "upload-1");
    }

    #[test]
    fn sanitizes_path_traversal_attempts() {
        let name = derive_blob_filename(Some("../../etc/passwd"), "upload-2");
        assert!(!name.contains(".."));
        assert!(!name.contains('/'));
    }

    #[tokio::test]
    async fn round_trips_a_blob_through_the_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(BlobStoreConfig {
            base_dir: dir.path().to_path_buf(),
        })
        .await
        .unwrap();

        store.store_blob("sample", b"hello".to_vec()).await.unwrap();
        let data = store.get_blob("sample").await.unwrap();
        assert_eq!(data, b"hello");

        store.delete_blob("sample").await.unwrap();
        assert!(store.get_blob("sample").await.is_err());
    }
}
