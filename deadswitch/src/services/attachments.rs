//! Attachments service
//!
//! Files that travel with a switch's release. Bytes go to the storage
//! collaborator; only metadata and the opaque location reach the database.

use crate::config::{MAX_ATTACHMENT_BYTES, MAX_FILENAME_LENGTH};
use crate::crypto::hash_token;
use crate::database::{Attachment, Repository, SwitchStatus};
use crate::error::{AppError, Result};
use crate::storage::AttachmentStore;
use std::sync::Arc;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Service for managing attachments
#[derive(Clone)]
pub struct AttachmentsService {
    repo: Repository,
    store: Arc<dyn AttachmentStore>,
}

impl AttachmentsService {
    pub fn new(repo: Repository, store: Arc<dyn AttachmentStore>) -> Self {
        Self { repo, store }
    }

    /// Attach a file to the switch owning `token`
    pub async fn attach(
        &self,
        token: &str,
        filename: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<Attachment> {
        let switch = self.repo.get_switch_by_token(&hash_token(token)).await?;
        if switch.status == SwitchStatus::Triggered {
            return Err(AppError::AlreadyTriggered(switch.id));
        }

        if data.is_empty() {
            return Err(AppError::Validation("Attachment is empty".to_string()));
        }
        if data.len() > MAX_ATTACHMENT_BYTES {
            return Err(AppError::Validation(format!(
                "Attachment exceeds {} bytes",
                MAX_ATTACHMENT_BYTES
            )));
        }

        let safe_filename = sanitize_filename(filename);
        if safe_filename.is_empty() {
            return Err(AppError::Validation("Attachment filename is empty".to_string()));
        }

        let mime_type = match mime_type.trim() {
            "" => DEFAULT_MIME_TYPE,
            m => m,
        };

        let location = self.store.store(data).await?;

        let attachment = self
            .repo
            .create_attachment(&switch.id, &safe_filename, mime_type, data.len() as i64, &location)
            .await?;

        tracing::info!(
            "Attachment {} added to switch {} ({} bytes)",
            attachment.id,
            switch.id,
            data.len()
        );
        Ok(attachment)
    }

    /// Live attachments of a switch
    pub async fn list(&self, switch_id: &str) -> Result<Vec<Attachment>> {
        self.repo.list_attachments(switch_id).await
    }

    /// Live attachments of the switch owning `token`
    pub async fn list_owned(&self, token: &str) -> Result<Vec<Attachment>> {
        let switch = self.repo.get_switch_by_token(&hash_token(token)).await?;
        self.repo.list_attachments(&switch.id).await
    }

    /// Soft delete one attachment of the switch owning `token`. The blob
    /// stays until the switch is purged.
    pub async fn remove(&self, token: &str, attachment_id: &str) -> Result<()> {
        let switch = self.repo.get_switch_by_token(&hash_token(token)).await?;
        self.repo
            .soft_delete_attachment(attachment_id, &switch.id)
            .await?;

        tracing::info!("Attachment {} removed from switch {}", attachment_id, switch.id);
        Ok(())
    }
}

/// Strip path separators and control characters, cap the length
fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && !c.is_control())
        .take(MAX_FILENAME_LENGTH)
        .collect::<String>()
        .trim()
        .to_string()
}
