//! Legacy webhook targets
//!
//! Extra webhook endpoints kept in their own table. Each enabled row is an
//! additional trigger-event target next to the settings webhook.

use crate::database::{Repository, Webhook};
use crate::error::{AppError, Result};
use crate::services::settings::SettingsService;

#[derive(Clone)]
pub struct WebhookService {
    repo: Repository,
    settings: SettingsService,
}

impl WebhookService {
    pub fn new(repo: Repository, settings: SettingsService) -> Self {
        Self { repo, settings }
    }

    pub async fn create(&self, master_password: &str, url: &str, secret: &str) -> Result<Webhook> {
        self.settings.authorize(master_password).await?;

        let url = url.trim();
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid webhook URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(
                "Webhook URL scheme must be http or https".to_string(),
            ));
        }
        if secret.is_empty() {
            return Err(AppError::Validation("Webhook secret must not be empty".to_string()));
        }

        let webhook = self.repo.create_webhook(url, secret).await?;
        tracing::info!("Registered webhook {} -> {}", webhook.id, webhook.url);
        Ok(webhook)
    }

    pub async fn list(&self, master_password: &str) -> Result<Vec<Webhook>> {
        self.settings.authorize(master_password).await?;
        self.repo.list_webhooks().await
    }

    pub async fn set_enabled(&self, master_password: &str, id: &str, enabled: bool) -> Result<()> {
        self.settings.authorize(master_password).await?;
        self.repo.set_webhook_enabled(id, enabled).await?;
        tracing::info!("Webhook {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn delete(&self, master_password: &str, id: &str) -> Result<()> {
        self.settings.authorize(master_password).await?;
        self.repo.delete_webhook(id).await?;
        tracing::info!("Webhook {} removed", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    const PASSWORD: &str = "correct horse battery";

    async fn create_test_service() -> WebhookService {
        let repo = Repository::new(test_pool().await);
        let settings = SettingsService::new(repo.clone());
        settings.initialize(PASSWORD).await.unwrap();
        WebhookService::new(repo, settings)
    }

    #[tokio::test]
    async fn test_webhook_crud() {
        let service = create_test_service().await;

        let hook = service
            .create(PASSWORD, "https://hooks.example.com/a", "secret")
            .await
            .unwrap();
        assert!(hook.enabled);

        service.set_enabled(PASSWORD, &hook.id, false).await.unwrap();
        let hooks = service.list(PASSWORD).await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert!(!hooks[0].enabled);

        // Secret never serialized
        let json = serde_json::to_string(&hooks).unwrap();
        assert!(!json.contains("secret"));

        service.delete(PASSWORD, &hook.id).await.unwrap();
        assert!(matches!(
            service.delete(PASSWORD, &hook.id).await,
            Err(AppError::WebhookNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_validation_and_auth() {
        let service = create_test_service().await;

        assert!(matches!(
            service.create("wrong password!", "https://x.example.com", "s").await,
            Err(AppError::Unauthorized)
        ));
        assert!(service.create(PASSWORD, "not a url", "s").await.is_err());
        assert!(service.create(PASSWORD, "file:///etc/passwd", "s").await.is_err());
        assert!(service.create(PASSWORD, "https://x.example.com", "").await.is_err());
    }
}
