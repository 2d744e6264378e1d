//! Settings commands

use crate::app::AppState;
use crate::database::{SettingsRequest, SettingsView};
use crate::error::Result;
use crate::services::settings::{InitializedSettings, UpdatedSettings};

/// First-run setup
pub async fn init_settings(state: &AppState, master_password: &str) -> Result<InitializedSettings> {
    state.settings_service.initialize(master_password).await
}

/// Redacted settings
pub async fn get_settings(state: &AppState) -> Result<SettingsView> {
    state.settings_service.view().await
}

pub async fn update_settings(
    state: &AppState,
    master_password: &str,
    request: SettingsRequest,
) -> Result<UpdatedSettings> {
    state.settings_service.update(master_password, request).await
}
