//! Database models
//!
//! Rust structs representing database entities.
//! Entities holding secrets or ciphertext are not `Serialize`; their
//! external shapes are the explicit view types at the bottom of this file.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Switch status. Monotonic: `Active` may become `Triggered`, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SwitchStatus {
    Active,
    Triggered,
}

/// Soft-deletion lifecycle. Deleted rows stay for audit but are excluded from sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Active,
    Deleted,
}

/// Release delivery progress of a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Not triggered yet
    None,
    /// Triggered, at least one channel still owes a delivery
    Pending,
    /// Every channel confirmed
    Delivered,
    /// Attempt cap reached; waits for an operator retry
    Failed,
    /// Payload could not be decrypted; waits for an operator retry with a second factor
    Undecryptable,
}

/// A dead man's switch
#[derive(Debug, Clone, FromRow)]
pub struct Switch {
    pub id: String,
    /// JSON payload envelope, see `crypto`
    pub content: String,
    pub key_fragment: String,
    /// SHA-256 of the management token; the token itself is never stored
    pub management_token_hash: String,
    pub recipient_email: String,
    pub trigger_duration_minutes: i64,
    pub last_seen: DateTime<Utc>,
    /// Bumped on every check-in; conditional updates match on it
    pub version: i64,
    pub status: SwitchStatus,
    pub triggered_at: Option<DateTime<Utc>>,
    pub lifecycle: Lifecycle,
    pub deleted_at: Option<DateTime<Utc>>,
    pub delivery: DeliveryState,
    pub email_delivered: bool,
    pub webhook_delivered: bool,
    pub delivery_attempts: i64,
    /// Unix seconds until which one worker owns the release delivery, or
    /// before which the next attempt of an incomplete release is not due
    pub delivery_lease_until: i64,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Switch {
    /// Instant at which the switch expires if the owner stays silent
    pub fn trigger_at(&self) -> DateTime<Utc> {
        self.last_seen + Duration::minutes(self.trigger_duration_minutes)
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle == Lifecycle::Deleted
    }
}

/// Insert shape for a switch. The identifier is assigned here and nowhere else.
#[derive(Debug, Clone)]
pub struct NewSwitch {
    pub id: String,
    pub content: String,
    pub key_fragment: String,
    pub management_token_hash: String,
    pub recipient_email: String,
    pub trigger_duration_minutes: i64,
    pub reminder_offsets: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewSwitch {
    pub fn new(
        content: String,
        key_fragment: String,
        management_token_hash: String,
        recipient_email: String,
        trigger_duration_minutes: i64,
        reminder_offsets: Vec<i64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            key_fragment,
            management_token_hash,
            recipient_email,
            trigger_duration_minutes,
            reminder_offsets,
            created_at,
        }
    }
}

/// Outcome of one release attempt, as recorded against the switch
#[derive(Debug, Clone, Default)]
pub struct DeliveryAttempt {
    pub email_delivered: bool,
    /// Every enabled webhook target has acknowledged the release
    pub webhook_delivered: bool,
    /// Webhook sources that acknowledged this attempt
    pub delivered_webhooks: Vec<String>,
    pub last_error: Option<String>,
}

/// Pre-trigger notification scheduled `minutes_before` the trigger instant
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reminder {
    pub id: String,
    pub switch_id: String,
    pub minutes_before: i64,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// File attachment linked to a switch message
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    /// Opaque location returned by the blob store
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Legacy webhook target
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Singleton settings row, secrets included
#[derive(Debug, Clone, Default, FromRow)]
pub struct SettingsRow {
    pub smtp_host: Option<String>,
    pub smtp_port: Option<i64>,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub smtp_from: Option<String>,
    pub smtp_from_name: Option<String>,
    pub master_password_hash: Option<String>,
    pub recovery_key_hash: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_enabled: bool,
    pub owner_email: Option<String>,
    pub heartbeat_token: Option<String>,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Settings write request. Absent fields are left unchanged; an empty
/// string clears an optional field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsRequest {
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub smtp_from: Option<String>,
    pub smtp_from_name: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_enabled: Option<bool>,
    pub owner_email: Option<String>,
    pub new_master_password: Option<String>,
    /// Replace the heartbeat token with a freshly generated one
    #[serde(default)]
    pub rotate_heartbeat_token: bool,
}

/// Settings read shape with every secret redacted
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub smtp_host: Option<String>,
    pub smtp_port: Option<i64>,
    pub smtp_user: Option<String>,
    pub smtp_pass_set: bool,
    pub smtp_from: Option<String>,
    pub smtp_from_name: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret_set: bool,
    pub webhook_enabled: bool,
    pub owner_email: Option<String>,
    pub initialized: bool,
    pub heartbeat_token_set: bool,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&SettingsRow> for SettingsView {
    fn from(row: &SettingsRow) -> Self {
        Self {
            smtp_host: row.smtp_host.clone(),
            smtp_port: row.smtp_port,
            smtp_user: row.smtp_user.clone(),
            smtp_pass_set: row.smtp_pass.is_some(),
            smtp_from: row.smtp_from.clone(),
            smtp_from_name: row.smtp_from_name.clone(),
            webhook_url: row.webhook_url.clone(),
            webhook_secret_set: row.webhook_secret.is_some(),
            webhook_enabled: row.webhook_enabled,
            owner_email: row.owner_email.clone(),
            initialized: row.master_password_hash.is_some(),
            heartbeat_token_set: row.heartbeat_token.is_some(),
            last_sweep_at: row.last_sweep_at,
            updated_at: row.updated_at,
        }
    }
}

/// Owner-facing view of a switch; never carries content or key material
#[derive(Debug, Clone, Serialize)]
pub struct SwitchView {
    pub id: String,
    pub recipient_email: String,
    pub trigger_duration_minutes: i64,
    pub last_seen: DateTime<Utc>,
    pub trigger_at: DateTime<Utc>,
    pub status: SwitchStatus,
    pub triggered_at: Option<DateTime<Utc>>,
    pub delivery: DeliveryState,
    pub delivery_attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Seconds until `trigger_at`; filled in by owner-facing status reads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
    pub reminders: Vec<ReminderView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReminderView {
    pub id: String,
    pub minutes_before: i64,
    pub due_at: DateTime<Utc>,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
}

impl SwitchView {
    pub fn new(switch: &Switch, reminders: &[Reminder]) -> Self {
        let trigger_at = switch.trigger_at();
        Self {
            id: switch.id.clone(),
            recipient_email: switch.recipient_email.clone(),
            trigger_duration_minutes: switch.trigger_duration_minutes,
            last_seen: switch.last_seen,
            trigger_at,
            status: switch.status,
            triggered_at: switch.triggered_at,
            delivery: switch.delivery,
            delivery_attempts: switch.delivery_attempts,
            last_error: switch.last_error.clone(),
            created_at: switch.created_at,
            remaining_seconds: None,
            reminders: reminders
                .iter()
                .map(|r| ReminderView {
                    id: r.id.clone(),
                    minutes_before: r.minutes_before,
                    due_at: trigger_at - Duration::minutes(r.minutes_before),
                    sent: r.sent,
                    sent_at: r.sent_at,
                })
                .collect(),
        }
    }

    /// Attach the time left before the trigger
    pub fn with_remaining(mut self, remaining: Duration) -> Self {
        self.remaining_seconds = Some(remaining.num_seconds());
        self
    }
}
