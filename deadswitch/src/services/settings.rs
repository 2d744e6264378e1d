//! Settings service
//!
//! The only write path to the settings singleton. Reads hand out the
//! redacted `SettingsView`; every write is gated by the master password.

use crate::config::{DEFAULT_SMTP_PORT, MAX_EMAIL_LENGTH, MIN_MASTER_PASSWORD_LENGTH};
use crate::crypto::{generate_token, hash_secret, verify_secret};
use crate::database::{Repository, SettingsRequest, SettingsRow, SettingsView};
use crate::error::{AppError, Result};
use crate::notify::MailConfig;
use chrono::Utc;
use serde::Serialize;

/// Secrets produced by first-run setup. Shown once, never stored in clear.
#[derive(Debug, Clone, Serialize)]
pub struct InitializedSettings {
    pub recovery_key: String,
    pub heartbeat_token: String,
}

/// Result of a settings update
#[derive(Debug, Clone, Serialize)]
pub struct UpdatedSettings {
    pub settings: SettingsView,
    /// Present only when the heartbeat token was rotated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_token: Option<String>,
}

#[derive(Clone)]
pub struct SettingsService {
    repo: Repository,
}

impl SettingsService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// First-run setup: set the master password and mint the recovery key
    /// and heartbeat token.
    pub async fn initialize(&self, master_password: &str) -> Result<InitializedSettings> {
        let mut row = self.repo.get_settings().await?;
        if row.master_password_hash.is_some() {
            return Err(AppError::Validation("Settings are already initialized".to_string()));
        }

        validate_master_password(master_password)?;

        let recovery_key = generate_token();
        let heartbeat_token = generate_token();

        row.master_password_hash = Some(hash_secret(master_password)?);
        row.recovery_key_hash = Some(hash_secret(&recovery_key)?);
        row.heartbeat_token = Some(heartbeat_token.clone());

        self.repo.save_settings(&row, Utc::now()).await?;
        tracing::info!("Settings initialized");

        Ok(InitializedSettings {
            recovery_key,
            heartbeat_token,
        })
    }

    /// Redacted settings
    pub async fn view(&self) -> Result<SettingsView> {
        let row = self.repo.get_settings().await?;
        Ok(SettingsView::from(&row))
    }

    /// Raw settings for internal consumers (dispatcher, sweep)
    pub async fn load(&self) -> Result<SettingsRow> {
        self.repo.get_settings().await
    }

    /// Yes/no decision on the master password
    pub async fn authorize(&self, master_password: &str) -> Result<()> {
        let row = self.repo.get_settings().await?;
        authorize_row(&row, master_password)
    }

    /// Apply a validated settings change
    pub async fn update(
        &self,
        master_password: &str,
        request: SettingsRequest,
    ) -> Result<UpdatedSettings> {
        let mut row = self.repo.get_settings().await?;
        authorize_row(&row, master_password)?;

        let heartbeat_token = apply_request(&mut row, request)?;

        self.repo.save_settings(&row, Utc::now()).await?;
        tracing::info!("Settings updated");

        let row = self.repo.get_settings().await?;
        Ok(UpdatedSettings {
            settings: SettingsView::from(&row),
            heartbeat_token,
        })
    }

    /// Check a recovery key against the stored hash
    pub async fn verify_recovery_key(&self, recovery_key: &str) -> Result<()> {
        let row = self.repo.get_settings().await?;
        let hash = row.recovery_key_hash.as_deref().ok_or_else(|| {
            AppError::Configuration("Settings are not initialized; run `init` first".to_string())
        })?;

        if verify_secret(recovery_key, hash) {
            Ok(())
        } else {
            Err(AppError::Configuration(
                "Recovery key does not match the one issued at init".to_string(),
            ))
        }
    }
}

fn authorize_row(row: &SettingsRow, master_password: &str) -> Result<()> {
    match row.master_password_hash.as_deref() {
        Some(hash) if verify_secret(master_password, hash) => Ok(()),
        Some(_) => {
            tracing::warn!("Rejected settings access with wrong master password");
            Err(AppError::Unauthorized)
        }
        None => Err(AppError::Configuration(
            "Settings are not initialized; run `init` first".to_string(),
        )),
    }
}

fn validate_master_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_MASTER_PASSWORD_LENGTH {
        return Err(AppError::Validation(format!(
            "Master password must be at least {} characters",
            MIN_MASTER_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Empty string clears, absent leaves unchanged
fn merge(field: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        let trimmed = value.trim();
        *field = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
}

/// Validate an email address the way outbound mail will parse it
pub fn validate_email(address: &str) -> Result<()> {
    if address.len() > MAX_EMAIL_LENGTH {
        return Err(AppError::Validation(format!(
            "Email address longer than {} characters",
            MAX_EMAIL_LENGTH
        )));
    }
    address
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|e| AppError::Validation(format!("Invalid email address '{}': {}", address, e)))
}

fn validate_webhook_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("Invalid webhook URL: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(AppError::Validation(format!(
            "Webhook URL scheme must be http or https, got {}",
            other
        ))),
    }
}

/// Merge a request into the row and validate the result. Returns the new
/// heartbeat token when it was rotated.
fn apply_request(row: &mut SettingsRow, request: SettingsRequest) -> Result<Option<String>> {
    merge(&mut row.smtp_host, request.smtp_host);
    merge(&mut row.smtp_user, request.smtp_user);
    merge(&mut row.smtp_pass, request.smtp_pass);
    merge(&mut row.smtp_from, request.smtp_from);
    merge(&mut row.smtp_from_name, request.smtp_from_name);
    merge(&mut row.webhook_url, request.webhook_url);
    merge(&mut row.webhook_secret, request.webhook_secret);
    merge(&mut row.owner_email, request.owner_email);

    if let Some(port) = request.smtp_port {
        if port == 0 {
            return Err(AppError::Validation("SMTP port must not be 0".to_string()));
        }
        row.smtp_port = Some(i64::from(port));
    }
    if let Some(enabled) = request.webhook_enabled {
        row.webhook_enabled = enabled;
    }

    if let Some(from) = &row.smtp_from {
        validate_email(from)?;
    }
    if let Some(owner) = &row.owner_email {
        validate_email(owner)?;
    }
    if let Some(url) = &row.webhook_url {
        validate_webhook_url(url)?;
    }
    if row.webhook_enabled && (row.webhook_url.is_none() || row.webhook_secret.is_none()) {
        return Err(AppError::Validation(
            "An enabled webhook needs both a URL and a secret".to_string(),
        ));
    }

    if let Some(password) = request.new_master_password {
        validate_master_password(&password)?;
        row.master_password_hash = Some(hash_secret(&password)?);
    }

    if request.rotate_heartbeat_token {
        let token = generate_token();
        row.heartbeat_token = Some(token.clone());
        return Ok(Some(token));
    }

    Ok(None)
}

/// SMTP settings, if enough of them are configured to send mail
pub fn mail_config(row: &SettingsRow) -> Option<MailConfig> {
    let host = row.smtp_host.clone()?;
    let from = row.smtp_from.clone()?;

    let port = row
        .smtp_port
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_SMTP_PORT);

    Some(MailConfig {
        host,
        port,
        username: row.smtp_user.clone(),
        password: row.smtp_pass.clone(),
        from,
        from_name: row.smtp_from_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    const PASSWORD: &str = "correct horse battery";

    async fn create_test_service() -> SettingsService {
        SettingsService::new(Repository::new(test_pool().await))
    }

    #[tokio::test]
    async fn test_initialize_once() {
        let service = create_test_service().await;

        let secrets = service.initialize(PASSWORD).await.unwrap();
        assert!(!secrets.recovery_key.is_empty());
        assert_ne!(secrets.recovery_key, secrets.heartbeat_token);

        let view = service.view().await.unwrap();
        assert!(view.initialized);
        assert!(view.heartbeat_token_set);

        let again = service.initialize(PASSWORD).await;
        assert!(matches!(again, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_initialize_rejects_short_password() {
        let service = create_test_service().await;
        assert!(matches!(
            service.initialize("short").await,
            Err(AppError::Validation(_))
        ));
        assert!(!service.view().await.unwrap().initialized);
    }

    #[tokio::test]
    async fn test_recovery_key_is_verified_not_stored() {
        let service = create_test_service().await;
        let secrets = service.initialize(PASSWORD).await.unwrap();

        service.verify_recovery_key(&secrets.recovery_key).await.unwrap();
        assert!(service.verify_recovery_key("not-the-key").await.is_err());

        let row = service.load().await.unwrap();
        assert_ne!(row.recovery_key_hash.as_deref(), Some(secrets.recovery_key.as_str()));
    }

    #[tokio::test]
    async fn test_update_requires_master_password() {
        let service = create_test_service().await;

        let before_init = service.update(PASSWORD, SettingsRequest::default()).await;
        assert!(matches!(before_init, Err(AppError::Configuration(_))));

        service.initialize(PASSWORD).await.unwrap();

        let wrong = service.update("wrong password!", SettingsRequest::default()).await;
        assert!(matches!(wrong, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_update_redacts_secrets() {
        let service = create_test_service().await;
        service.initialize(PASSWORD).await.unwrap();

        let request = SettingsRequest {
            smtp_host: Some("smtp.example.com".to_string()),
            smtp_port: Some(465),
            smtp_pass: Some("hunter2".to_string()),
            smtp_from: Some("switch@example.com".to_string()),
            owner_email: Some("owner@example.com".to_string()),
            webhook_url: Some("https://hooks.example.com/in".to_string()),
            webhook_secret: Some("s3cret".to_string()),
            webhook_enabled: Some(true),
            ..SettingsRequest::default()
        };

        let updated = service.update(PASSWORD, request).await.unwrap();
        assert!(updated.heartbeat_token.is_none());
        assert!(updated.settings.smtp_pass_set);
        assert!(updated.settings.webhook_secret_set);
        assert_eq!(updated.settings.smtp_port, Some(465));

        let json = serde_json::to_string(&updated).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_update_validation() {
        let service = create_test_service().await;
        service.initialize(PASSWORD).await.unwrap();

        let bad_email = SettingsRequest {
            owner_email: Some("nope".to_string()),
            ..SettingsRequest::default()
        };
        assert!(matches!(
            service.update(PASSWORD, bad_email).await,
            Err(AppError::Validation(_))
        ));

        let bad_url = SettingsRequest {
            webhook_url: Some("ftp://example.com".to_string()),
            ..SettingsRequest::default()
        };
        assert!(service.update(PASSWORD, bad_url).await.is_err());

        let enabled_without_secret = SettingsRequest {
            webhook_url: Some("https://example.com/hook".to_string()),
            webhook_enabled: Some(true),
            ..SettingsRequest::default()
        };
        assert!(service.update(PASSWORD, enabled_without_secret).await.is_err());

        // Nothing was persisted by the rejected requests
        let view = service.view().await.unwrap();
        assert!(view.owner_email.is_none());
        assert!(view.webhook_url.is_none());
    }

    #[tokio::test]
    async fn test_empty_string_clears_field() {
        let service = create_test_service().await;
        service.initialize(PASSWORD).await.unwrap();

        let set = SettingsRequest {
            owner_email: Some("owner@example.com".to_string()),
            ..SettingsRequest::default()
        };
        service.update(PASSWORD, set).await.unwrap();

        let clear = SettingsRequest {
            owner_email: Some(String::new()),
            ..SettingsRequest::default()
        };
        let updated = service.update(PASSWORD, clear).await.unwrap();
        assert!(updated.settings.owner_email.is_none());
    }

    #[tokio::test]
    async fn test_rotate_heartbeat_and_change_password() {
        let service = create_test_service().await;
        let secrets = service.initialize(PASSWORD).await.unwrap();

        let request = SettingsRequest {
            rotate_heartbeat_token: true,
            new_master_password: Some("an even longer password".to_string()),
            ..SettingsRequest::default()
        };
        let updated = service.update(PASSWORD, request).await.unwrap();

        let rotated = updated.heartbeat_token.unwrap();
        assert_ne!(rotated, secrets.heartbeat_token);

        assert!(service.authorize(PASSWORD).await.is_err());
        service.authorize("an even longer password").await.unwrap();
    }

    #[test]
    fn test_mail_config_requires_host_and_from() {
        let mut row = SettingsRow::default();
        assert!(mail_config(&row).is_none());

        row.smtp_host = Some("smtp.example.com".to_string());
        assert!(mail_config(&row).is_none());

        row.smtp_from = Some("switch@example.com".to_string());
        let config = mail_config(&row).unwrap();
        assert_eq!(config.port, DEFAULT_SMTP_PORT);
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("someone@example.com").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        let long = format!("{}@example.com", "a".repeat(MAX_EMAIL_LENGTH));
        assert!(validate_email(&long).is_err());
    }
}
