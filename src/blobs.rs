// Content-addressed blob storage on the local filesystem.
//
// Blobs are opaque byte files named by a random hex id, sharded by the first
// two id characters. Writes land in a scratch directory first and are
// renamed into place, so a readable blob is always complete.

use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid blob id")]
    InvalidId,

    #[error("Blob {0} not found")]
    NotFound(String),
}

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens the store, creating the directory layout when missing.
    pub async fn initialize(root: &Path) -> Result<Self, BlobError> {
        tokio::fs::create_dir_all(root.join("tmp")).await?;
        tracing::info!(root = ?root, "Blob store initialized");
        Ok(BlobStore {
            root: root.to_path_buf(),
        })
    }

    fn new_id() -> String {
        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }

    fn path_for(&self, blob_id: &str) -> Result<PathBuf, BlobError> {
        if blob_id.len() != 32 || !blob_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::InvalidId);
        }
        Ok(self.root.join(&blob_id[..2]).join(blob_id))
    }

    /// Stores a blob and returns its id.
    #[tracing::instrument(err, skip_all, fields(size = data.len()))]
    pub async fn put(&self, data: &[u8]) -> Result<String, BlobError> {
        let blob_id = Self::new_id();
        let scratch = self.root.join("tmp").join(&blob_id);
        let target = self.path_for(&blob_id)?;

        tokio::fs::write(&scratch, data)
            .instrument(tracing::debug_span!("blob write", blob_id))
            .await?;
        if let Some(shard) = target.parent() {
            tokio::fs::create_dir_all(shard).await?;
        }
        tokio::fs::rename(&scratch, &target).await?;

        tracing::debug!(blob_id, "stored blob");
        Ok(blob_id)
    }

    /// Reads a whole blob back.
    #[tracing::instrument(err, skip(self))]
    pub async fn get(&self, blob_id: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(blob_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(blob_id.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Removes a blob. Missing files are fine, deletion is idempotent.
    #[tracing::instrument(err, skip(self))]
    pub async fn delete(&self, blob_id: &str) -> Result<(), BlobError> {
        let path = self.path_for(blob_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        tokio::fs::metadata(&self.root).await.is_ok()
    }
}
