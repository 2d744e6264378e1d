//! Notification dispatcher
//!
//! Sends reminder emails, release emails and signed webhook events. Each
//! attempt is bounded by a timeout; attempts per channel are bounded with
//! linear backoff. Email and every webhook target are dispatched
//! concurrently and never block each other: a webhook failure is reported
//! next to a delivered email, not instead of it.

use crate::config::{DISPATCH_ATTEMPT_TIMEOUT, DISPATCH_BACKOFF, DISPATCH_MAX_ATTEMPTS};
use crate::database::{Attachment, Reminder, SettingsRow, Switch, Webhook};
use crate::error::{AppError, Result};
use crate::notify::{Mailer, OutgoingEmail, WebhookSender};
use crate::services::settings::mail_config;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const EVENT_TRIGGERED: &str = "switch.triggered";
pub const EVENT_TEST: &str = "test";

/// Timeout and retry bounds for one channel
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: DISPATCH_ATTEMPT_TIMEOUT,
            max_attempts: DISPATCH_MAX_ATTEMPTS,
            backoff: DISPATCH_BACKOFF,
        }
    }
}

/// Result of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum ChannelOutcome {
    Delivered,
    /// Nothing to do: channel disabled, not configured, or delivered earlier
    Skipped(String),
    Failed(String),
}

impl ChannelOutcome {
    pub fn is_done(&self) -> bool {
        !matches!(self, ChannelOutcome::Failed(_))
    }

    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => ChannelOutcome::Delivered,
            Err(e) => ChannelOutcome::Failed(e.to_string()),
        }
    }
}

/// A webhook endpoint resolved from settings or the legacy table
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    /// `settings` or the legacy webhook id
    pub source: String,
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResult {
    pub source: String,
    pub url: String,
    pub outcome: ChannelOutcome,
}

/// Per-channel outcome of one release attempt
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub email: ChannelOutcome,
    pub webhooks: Vec<WebhookResult>,
}

impl TriggerReport {
    pub fn email_done(&self) -> bool {
        self.email.is_done()
    }

    /// Every webhook target delivered or skipped
    pub fn webhooks_done(&self) -> bool {
        self.webhooks.iter().all(|w| w.outcome.is_done())
    }

    /// Sources of the webhook targets that acknowledged this attempt
    pub fn delivered_webhooks(&self) -> Vec<String> {
        self.webhooks
            .iter()
            .filter(|w| w.outcome == ChannelOutcome::Delivered)
            .map(|w| w.source.clone())
            .collect()
    }

    /// Combined error text for the failed channels
    pub fn error_summary(&self) -> Option<String> {
        let mut errors = Vec::new();
        if let ChannelOutcome::Failed(e) = &self.email {
            errors.push(format!("email: {}", e));
        }
        for hook in &self.webhooks {
            if let ChannelOutcome::Failed(e) = &hook.outcome {
                errors.push(format!("webhook {}: {}", hook.source, e));
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

/// Everything one release attempt sends
#[derive(Debug, Clone, Copy)]
pub struct ReleasePayload<'a> {
    pub switch: &'a Switch,
    pub message: &'a str,
    pub attachments: &'a [Attachment],
    /// Webhook sources that acknowledged an earlier attempt
    pub delivered_webhooks: &'a HashSet<String>,
}

/// JSON body of a webhook event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn triggered(switch: &Switch, now: DateTime<Utc>) -> Self {
        Self {
            event: EVENT_TRIGGERED.to_string(),
            switch_id: Some(switch.id.clone()),
            recipient_email: Some(switch.recipient_email.clone()),
            triggered_at: switch.triggered_at.or(Some(now)),
            last_seen: Some(switch.last_seen),
            timestamp: now,
        }
    }

    pub fn test(now: DateTime<Utc>) -> Self {
        Self {
            event: EVENT_TEST.to_string(),
            switch_id: None,
            recipient_email: None,
            triggered_at: None,
            last_seen: None,
            timestamp: now,
        }
    }
}

/// Enabled webhook targets: the settings webhook first, then legacy rows.
/// Disabled or incomplete entries are left out.
pub fn webhook_targets(settings: &SettingsRow, legacy: &[Webhook]) -> Vec<WebhookTarget> {
    let mut targets = Vec::new();

    if settings.webhook_enabled {
        if let (Some(url), Some(secret)) = (&settings.webhook_url, &settings.webhook_secret) {
            targets.push(WebhookTarget {
                source: "settings".to_string(),
                url: url.clone(),
                secret: secret.clone(),
            });
        }
    }

    targets.extend(legacy.iter().filter(|w| w.enabled).map(|w| WebhookTarget {
        source: w.id.clone(),
        url: w.url.clone(),
        secret: w.secret.clone(),
    }));

    targets
}

#[derive(Clone)]
pub struct Dispatcher {
    mailer: Arc<dyn Mailer>,
    webhooks: Arc<dyn WebhookSender>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, webhooks: Arc<dyn WebhookSender>) -> Self {
        Self {
            mailer,
            webhooks,
            policy: DispatchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run `op` under the attempt timeout, retrying with linear backoff.
    /// Configuration errors are not retried.
    async fn with_retry<F, Fut, T>(&self, channel: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let err = match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e @ AppError::Configuration(_))) => return Err(e),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.policy.attempt_timeout),
            };

            tracing::warn!("{} attempt {}/{} failed: {}", channel, attempt, attempts, err);
            last_error = Some(err);

            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff * attempt).await;
            }
        }

        Err(AppError::dispatch(
            channel,
            last_error.unwrap_or_else(|| "no attempt made".to_string()),
        ))
    }

    async fn send_email(&self, settings: &SettingsRow, email: OutgoingEmail) -> Result<()> {
        let config = mail_config(settings).ok_or_else(|| {
            AppError::Configuration("SMTP host and sender address are not configured".to_string())
        })?;

        self.with_retry("email", || self.mailer.send(&config, &email)).await
    }

    /// Reminder email to the owner
    pub async fn send_reminder(
        &self,
        settings: &SettingsRow,
        switch: &Switch,
        reminder: &Reminder,
    ) -> Result<()> {
        let owner = settings.owner_email.clone().ok_or_else(|| {
            AppError::Configuration("No owner email configured for reminders".to_string())
        })?;

        let email = OutgoingEmail {
            to: owner,
            subject: format!(
                "Check in: switch {} triggers in {} minutes",
                short_id(&switch.id),
                reminder.minutes_before
            ),
            body: reminder_body(switch, reminder),
        };

        self.send_email(settings, email).await?;
        tracing::info!(
            "Reminder {} sent for switch {} ({} minutes before)",
            reminder.id,
            switch.id,
            reminder.minutes_before
        );
        Ok(())
    }

    /// Release email with the decrypted message to the recipient
    pub async fn send_trigger(
        &self,
        settings: &SettingsRow,
        switch: &Switch,
        message: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let email = OutgoingEmail {
            to: switch.recipient_email.clone(),
            subject: "A message has been released to you".to_string(),
            body: release_body(switch, message, attachments),
        };

        self.send_email(settings, email).await?;
        tracing::info!("Release email sent for switch {}", switch.id);
        Ok(())
    }

    /// Post `event` to every target concurrently. Results keep target order.
    pub async fn send_webhook(&self, event: &WebhookEvent, targets: &[WebhookTarget]) -> Vec<WebhookResult> {
        let body = match serde_json::to_string(event) {
            Ok(body) => body,
            Err(e) => {
                return targets
                    .iter()
                    .map(|t| WebhookResult {
                        source: t.source.clone(),
                        url: t.url.clone(),
                        outcome: ChannelOutcome::Failed(e.to_string()),
                    })
                    .collect();
            }
        };

        join_all(targets.iter().map(|target| self.post_target(event, target, &body))).await
    }

    async fn post_target(&self, event: &WebhookEvent, target: &WebhookTarget, body: &str) -> WebhookResult {
        let result = self
            .with_retry("webhook", || {
                self.webhooks
                    .post(&target.url, &target.secret, &event.event, body)
            })
            .await
            .map(|_status| ());

        if let Err(e) = &result {
            tracing::error!("Webhook {} to {} failed: {}", event.event, target.url, e);
        }

        WebhookResult {
            source: target.source.clone(),
            url: target.url.clone(),
            outcome: ChannelOutcome::from_result(result),
        }
    }

    /// One release attempt. The email and webhook targets delivered by an
    /// earlier attempt are skipped; the rest go out concurrently.
    pub async fn release(
        &self,
        settings: &SettingsRow,
        legacy: &[Webhook],
        payload: ReleasePayload<'_>,
        now: DateTime<Utc>,
    ) -> TriggerReport {
        let switch = payload.switch;

        let email = async {
            if switch.email_delivered {
                return ChannelOutcome::Skipped("delivered earlier".to_string());
            }
            let result = self
                .send_trigger(settings, switch, payload.message, payload.attachments)
                .await;
            if let Err(e) = &result {
                tracing::error!("Release email for switch {} failed: {}", switch.id, e);
            }
            ChannelOutcome::from_result(result)
        };

        let webhooks = async {
            if switch.webhook_delivered {
                return Vec::new();
            }
            let targets = webhook_targets(settings, legacy);
            if targets.is_empty() {
                tracing::debug!("No enabled webhook for switch {}", switch.id);
            }

            let (done, due): (Vec<_>, Vec<_>) = targets
                .into_iter()
                .partition(|t| payload.delivered_webhooks.contains(&t.source));

            let mut results = self
                .send_webhook(&WebhookEvent::triggered(switch, now), &due)
                .await;
            results.extend(done.into_iter().map(|t| WebhookResult {
                source: t.source,
                url: t.url,
                outcome: ChannelOutcome::Skipped("delivered earlier".to_string()),
            }));
            results
        };

        let (email, webhooks) = tokio::join!(email, webhooks);
        TriggerReport { email, webhooks }
    }

    /// Signed `test` event to every enabled target
    pub async fn webhook_test(
        &self,
        settings: &SettingsRow,
        legacy: &[Webhook],
        now: DateTime<Utc>,
    ) -> Vec<WebhookResult> {
        let targets = webhook_targets(settings, legacy);
        self.send_webhook(&WebhookEvent::test(now), &targets).await
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn reminder_body(switch: &Switch, reminder: &Reminder) -> String {
    format!(
        "Your switch {} has not seen a check-in since {}.\n\
         It will trigger at {} ({} minutes from the time this reminder was scheduled).\n\n\
         Check in with your management token to reset the timer.\n",
        switch.id,
        switch.last_seen.to_rfc3339(),
        switch.trigger_at().to_rfc3339(),
        reminder.minutes_before
    )
}

fn release_body(switch: &Switch, message: &str, attachments: &[Attachment]) -> String {
    let mut body = format!(
        "The sender of this message has not checked in since {} and asked for it to be delivered to you.\n\n\
         ----\n{}\n----\n",
        switch.last_seen.to_rfc3339(),
        message
    );

    if !attachments.is_empty() {
        body.push_str("\nAttachments:\n");
        for attachment in attachments {
            body.push_str(&format!(
                "  - {} ({} bytes, {})\n",
                attachment.filename, attachment.size, attachment.mime_type
            ));
        }
    }
    body
}
