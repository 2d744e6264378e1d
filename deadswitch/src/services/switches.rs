//! Switch management service
//!
//! Creation, owner access by management token, and administrative
//! purge/list. Owner-facing results never carry content or key material.

use crate::config::{MAX_MESSAGE_BYTES, MAX_TRIGGER_DURATION_MINUTES, MIN_TRIGGER_DURATION_MINUTES};
use crate::crypto::{self, generate_token, hash_token, SecondFactors, SlotKind};
use crate::database::{NewSwitch, Repository, Switch, SwitchView};
use crate::error::{AppError, Result};
use crate::services::evaluator::evaluate_switch;
use crate::services::reminders::normalize_offsets;
use crate::services::settings::{validate_email, SettingsService};
use crate::storage::AttachmentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Request to register a new switch
#[derive(Debug, Clone, Deserialize)]
pub struct NewSwitchRequest {
    pub recipient_email: String,
    pub message: String,
    pub trigger_duration_minutes: i64,
    #[serde(default)]
    pub reminders: Vec<i64>,
}

/// A freshly created switch. The management token appears here and nowhere else.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedSwitch {
    pub management_token: String,
    pub switch: SwitchView,
}

/// Outcome of a hard delete
#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub id: String,
    pub released_locations: Vec<String>,
}

#[derive(Clone)]
pub struct SwitchService {
    repo: Repository,
    settings: SettingsService,
    store: Arc<dyn AttachmentStore>,
    recovery_key: Option<String>,
}

impl SwitchService {
    pub fn new(
        repo: Repository,
        settings: SettingsService,
        store: Arc<dyn AttachmentStore>,
        recovery_key: Option<String>,
    ) -> Self {
        Self {
            repo,
            settings,
            store,
            recovery_key,
        }
    }

    /// Validate, encrypt and persist a new switch
    pub async fn create(&self, request: NewSwitchRequest, now: DateTime<Utc>) -> Result<CreatedSwitch> {
        let recipient = request.recipient_email.trim().to_string();
        validate_email(&recipient)?;
        validate_duration(request.trigger_duration_minutes)?;
        validate_message(&request.message)?;
        let offsets = normalize_offsets(request.trigger_duration_minutes, &request.reminders)?;

        let recovery_key = self.recovery_key.as_deref().ok_or_else(|| {
            AppError::Configuration(
                "No recovery key configured; set DEADSWITCH_RECOVERY_KEY".to_string(),
            )
        })?;
        self.settings.verify_recovery_key(recovery_key).await?;

        let management_token = generate_token();
        let sealed = crypto::encrypt(
            request.message.as_bytes(),
            &SecondFactors {
                management_token: &management_token,
                recovery_key,
            },
        )?;

        let switch = self
            .repo
            .create_switch(NewSwitch::new(
                sealed.content,
                sealed.key_fragment,
                hash_token(&management_token),
                recipient,
                request.trigger_duration_minutes,
                offsets,
                now,
            ))
            .await?;

        let reminders = self.repo.list_reminders(&switch.id).await?;
        tracing::info!(
            "Created switch {} ({} minutes, {} reminders)",
            switch.id,
            switch.trigger_duration_minutes,
            reminders.len()
        );

        Ok(CreatedSwitch {
            management_token,
            switch: SwitchView::new(&switch, &reminders),
        })
    }

    /// Resolve a management token to its live switch
    pub async fn resolve(&self, token: &str) -> Result<Switch> {
        self.repo.get_switch_by_token(&hash_token(token)).await
    }

    /// Owner status view
    pub async fn status(&self, token: &str) -> Result<SwitchView> {
        let switch = self.resolve(token).await?;
        let reminders = self.repo.list_reminders(&switch.id).await?;
        let now = Utc::now();
        let view = SwitchView::new(&switch, &reminders);
        Ok(match evaluate_switch(&switch, now) {
            Some(eval) => view.with_remaining(eval.remaining(now)),
            None => view,
        })
    }

    /// Owner preview of the sealed message, opened with the management token
    pub async fn reveal(&self, token: &str) -> Result<String> {
        let switch = self.resolve(token).await?;
        let plaintext = crypto::decrypt(
            &switch.content,
            &switch.key_fragment,
            token,
            Some(SlotKind::ManagementToken),
        )?;
        String::from_utf8(plaintext)
            .map_err(|_| AppError::Decryption("Message is not valid UTF-8".to_string()))
    }

    /// Owner soft delete
    pub async fn delete(&self, token: &str, now: DateTime<Utc>) -> Result<()> {
        let switch = self.resolve(token).await?;
        self.repo.soft_delete_switch(&switch.id, now).await?;
        tracing::info!("Deleted switch {}", switch.id);
        Ok(())
    }

    /// Administrative hard delete. Blobs no longer referenced by any
    /// attachment are removed from storage.
    pub async fn purge(&self, master_password: &str, id: &str) -> Result<PurgeReport> {
        self.settings.authorize(master_password).await?;

        let locations: BTreeSet<String> = self.repo.purge_switch(id).await?.into_iter().collect();

        let mut released = Vec::new();
        for location in locations {
            if self.repo.count_attachment_references(&location).await? > 0 {
                continue;
            }
            match self.store.remove(&location).await {
                Ok(()) => released.push(location),
                Err(e) => tracing::warn!("Failed to remove blob {}: {}", location, e),
            }
        }

        tracing::info!("Purged switch {} ({} blobs released)", id, released.len());
        Ok(PurgeReport {
            id: id.to_string(),
            released_locations: released,
        })
    }

    /// Administrative listing of live switches
    pub async fn list(&self, master_password: &str) -> Result<Vec<SwitchView>> {
        self.settings.authorize(master_password).await?;

        let switches = self.repo.list_switches().await?;
        let mut views = Vec::with_capacity(switches.len());
        for switch in &switches {
            let reminders = self.repo.list_reminders(&switch.id).await?;
            views.push(SwitchView::new(switch, &reminders));
        }
        Ok(views)
    }
}

fn validate_duration(minutes: i64) -> Result<()> {
    if !(MIN_TRIGGER_DURATION_MINUTES..=MAX_TRIGGER_DURATION_MINUTES).contains(&minutes) {
        return Err(AppError::Validation(format!(
            "Trigger duration must be between {} and {} minutes",
            MIN_TRIGGER_DURATION_MINUTES, MAX_TRIGGER_DURATION_MINUTES
        )));
    }
    Ok(())
}

fn validate_message(message: &str) -> Result<()> {
    if message.trim().is_empty() {
        return Err(AppError::Validation("Message must not be empty".to_string()));
    }
    if message.len() > MAX_MESSAGE_BYTES {
        return Err(AppError::Validation(format!(
            "Message exceeds {} bytes",
            MAX_MESSAGE_BYTES
        )));
    }
    Ok(())
}
