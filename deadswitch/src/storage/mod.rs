//! Storage module
//!
//! Attachment bytes live outside the database. The core only ever keeps
//! the opaque location string a store hands back.

pub mod blob_store;

pub use blob_store::BlobStore;

use crate::error::Result;
use async_trait::async_trait;

/// Storage-path collaborator: bytes in, opaque location out
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Persist bytes and return where they live
    async fn store(&self, data: &[u8]) -> Result<String>;

    /// Release the bytes behind a location. Missing locations are not an error.
    async fn remove(&self, location: &str) -> Result<()>;
}
