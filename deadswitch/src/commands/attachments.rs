//! Attachment commands

use crate::app::AppState;
use crate::database::Attachment;
use crate::error::Result;
use std::path::Path;

/// Attach a file from disk; the stored name is the file's own name
pub async fn attach_file(
    state: &AppState,
    token: &str,
    file: &Path,
    mime_type: Option<&str>,
) -> Result<Attachment> {
    let data = tokio::fs::read(file).await?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    state
        .attachments_service
        .attach(token, &filename, mime_type.unwrap_or_default(), &data)
        .await
}

pub async fn list_attachments(state: &AppState, token: &str) -> Result<Vec<Attachment>> {
    state.attachments_service.list_owned(token).await
}

pub async fn remove_attachment(state: &AppState, token: &str, attachment_id: &str) -> Result<()> {
    state.attachments_service.remove(token, attachment_id).await
}
