//! Webhook target commands

use crate::app::AppState;
use crate::database::Webhook;
use crate::error::Result;
use crate::services::dispatcher::WebhookResult;
use chrono::Utc;

pub async fn add_webhook(state: &AppState, master_password: &str, url: &str, secret: &str) -> Result<Webhook> {
    state.webhook_service.create(master_password, url, secret).await
}

pub async fn list_webhooks(state: &AppState, master_password: &str) -> Result<Vec<Webhook>> {
    state.webhook_service.list(master_password).await
}

pub async fn set_webhook_enabled(
    state: &AppState,
    master_password: &str,
    id: &str,
    enabled: bool,
) -> Result<()> {
    state.webhook_service.set_enabled(master_password, id, enabled).await
}

pub async fn remove_webhook(state: &AppState, master_password: &str, id: &str) -> Result<()> {
    state.webhook_service.delete(master_password, id).await
}

/// Signed `test` event to every enabled target
pub async fn test_webhooks(state: &AppState, master_password: &str) -> Result<Vec<WebhookResult>> {
    state.settings_service.authorize(master_password).await?;
    state.orchestrator.webhook_test(Utc::now()).await
}
