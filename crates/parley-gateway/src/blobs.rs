//! Flat-file blob store for attachment bytes.
//!
//! Each attachment is stored as `{dir}/{file_id}`; metadata lives in the
//! database. Outbound payloads carry a URL served by the external
//! download endpoint.

use std::path::{Path, PathBuf};

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub struct BlobStore {
    dir: PathBuf,
    base_url: String,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        info!("Blob storage directory: {}", self.dir.display());
        Ok(())
    }

    pub fn path(&self, file_id: i64) -> PathBuf {
        self.dir.join(file_id.to_string())
    }

    pub async fn save(&self, file_id: i64, bytes: &[u8]) -> Result<()> {
        let path = self.path(file_id);
        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Missing files are tolerated; a delete race just means less work.
    pub async fn delete(&self, file_id: i64) -> Result<()> {
        let path = self.path(file_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("blob {file_id} already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetchable URL for an attachment, resolved by the external download
    /// endpoint.
    pub fn url(&self, file_id: i64) -> String {
        format!("{}/files/{}", self.base_url.trim_end_matches('/'), file_id)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Decode an inbound file payload: base64, optionally prefixed with a
/// data-URL header (`<mime>;base64,<payload>`) which is stripped first.
pub fn decode_file_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = match data.find(";base64,") {
        Some(idx) => &data[idx + ";base64,".len()..],
        None => data,
    };
    B64.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bare_base64() {
        assert_eq!(decode_file_payload("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn strips_data_url_prefix() {
        let payload = "data:image/png;base64,aGVsbG8=";
        assert_eq!(decode_file_payload(payload).unwrap(), b"hello");
    }

    #[test]
    fn rejects_malformed_base64() {
        assert!(decode_file_payload("not base64!!!").is_err());
    }

    #[test]
    fn urls_are_derived_from_the_base() {
        let store = BlobStore::new("/tmp/blobs", "http://files.example.com/");
        assert_eq!(store.url(7), "http://files.example.com/files/7");
    }

    #[tokio::test]
    async fn save_and_delete_round_trip() {
        let dir = std::env::temp_dir().join(format!("parley_blobs_{}", std::process::id()));
        let store = BlobStore::new(&dir, "http://localhost:8000");
        store.init().await.unwrap();

        store.save(1, b"payload").await.unwrap();
        assert_eq!(fs::read(store.path(1)).await.unwrap(), b"payload");

        store.delete(1).await.unwrap();
        // double delete is fine
        store.delete(1).await.unwrap();
        let _ = fs::remove_dir_all(&dir).await;
    }
}
