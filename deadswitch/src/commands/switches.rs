//! Switch commands
//!
//! Owner operations by management token plus the administrative ones.

use crate::app::AppState;
use crate::database::SwitchView;
use crate::error::{AppError, Result};
use crate::services::switches::PurgeReport;
use crate::services::{CreatedSwitch, NewSwitchRequest};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;

/// Decrypted message shown to its owner
#[derive(Debug, Serialize)]
pub struct RevealedMessage {
    pub message: String,
}

/// Register a new switch. The message comes from `message` or `message_file`.
pub async fn create_switch(
    state: &AppState,
    recipient: String,
    duration_minutes: i64,
    reminders: Vec<i64>,
    message: Option<String>,
    message_file: Option<&Path>,
) -> Result<CreatedSwitch> {
    let message = match (message, message_file) {
        (Some(message), _) => message,
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => {
            return Err(AppError::Validation(
                "Provide --message or --message-file".to_string(),
            ))
        }
    };

    state
        .switch_service
        .create(
            NewSwitchRequest {
                recipient_email: recipient,
                message,
                trigger_duration_minutes: duration_minutes,
                reminders,
            },
            Utc::now(),
        )
        .await
}

pub async fn check_in(state: &AppState, token: &str) -> Result<SwitchView> {
    state.heartbeat.check_in(token, Utc::now()).await
}

pub async fn switch_status(state: &AppState, token: &str) -> Result<SwitchView> {
    state.switch_service.status(token).await
}

pub async fn reveal_switch(state: &AppState, token: &str) -> Result<RevealedMessage> {
    let message = state.switch_service.reveal(token).await?;
    Ok(RevealedMessage { message })
}

pub async fn delete_switch(state: &AppState, token: &str) -> Result<()> {
    state.switch_service.delete(token, Utc::now()).await
}

pub async fn purge_switch(state: &AppState, master_password: &str, id: &str) -> Result<PurgeReport> {
    state.switch_service.purge(master_password, id).await
}

pub async fn list_switches(state: &AppState, master_password: &str) -> Result<Vec<SwitchView>> {
    state.switch_service.list(master_password).await
}
