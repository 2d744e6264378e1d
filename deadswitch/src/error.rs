//! Error types for deadswitch
//!
//! All errors use thiserror for structured error handling.
//! These errors can be serialized into command output.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Switch not found: {0}")]
    SwitchNotFound(String),

    #[error("Invalid or unknown management token")]
    InvalidToken,

    #[error("Switch already triggered: {0}")]
    AlreadyTriggered(String),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(String),

    #[error("Webhook not found: {0}")]
    WebhookNotFound(String),

    /// Payload could not be decrypted (wrong or missing second factor, corrupted envelope)
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// A single notification channel failed after its retries
    #[error("Dispatch error ({channel}): {message}")]
    Dispatch { channel: String, message: String },

    /// A conditional update matched no row because another writer got there first
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn dispatch(channel: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Dispatch {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
