//! Content-addressed attachment blobs
//!
//! A location is the SHA-256 hex digest of the bytes, laid out as
//! `<root>/<d[0..2]>/<d[2..4]>/<digest>`. Identical uploads share one file;
//! the repository counts references before a purge removes it.

use super::AttachmentStore;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the root directory
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        tracing::info!("Blob store ready at {:?}", self.root);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes behind a location
    pub async fn read(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::BlobStore(format!("No blob at {}", location)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn contains(&self, location: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(location)?).await?)
    }

    /// Only well-formed digests map to a path, so a stored location can
    /// never point outside the root.
    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let well_formed = location.len() == 64
            && location
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(AppError::BlobStore(format!(
                "Not a blob location: {:?}",
                location
            )));
        }
        Ok(self
            .root
            .join(&location[..2])
            .join(&location[2..4])
            .join(location))
    }
}

#[async_trait]
impl AttachmentStore for BlobStore {
    async fn store(&self, data: &[u8]) -> Result<String> {
        let location = hex::encode(Sha256::digest(data));
        let path = self.resolve(&location)?;

        if fs::try_exists(&path).await? {
            tracing::debug!("Blob {} already stored", location);
            return Ok(location);
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        // Readers only ever see a complete file
        let partial = path.with_extension("partial");
        let mut file = fs::File::create(&partial).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&partial, &path).await?;

        tracing::debug!("Stored blob {} ({} bytes)", location, data.len());
        Ok(location)
    }

    async fn remove(&self, location: &str) -> Result<()> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Removed blob {}", location);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
