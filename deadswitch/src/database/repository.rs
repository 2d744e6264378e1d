//! Repository layer for database operations
//!
//! CRUD operations for every entity plus the conditional updates that make
//! concurrent sweeps and check-ins safe. A conditional update that matches
//! no row returns `false`; callers treat that as a lost race.

use super::models::*;
use crate::config::release_retry_delay_secs;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ===== Switches =====

    /// Create a switch together with its reminders
    pub async fn create_switch(&self, new: NewSwitch) -> Result<Switch> {
        let mut tx = self.pool.begin().await?;

        let switch = sqlx::query_as::<_, Switch>(
            r#"
            INSERT INTO switches (
                id, content, key_fragment, management_token_hash, recipient_email,
                trigger_duration_minutes, last_seen, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&new.id)
        .bind(&new.content)
        .bind(&new.key_fragment)
        .bind(&new.management_token_hash)
        .bind(&new.recipient_email)
        .bind(new.trigger_duration_minutes)
        .bind(new.created_at)
        .bind(new.created_at)
        .bind(new.created_at)
        .fetch_one(&mut *tx)
        .await?;

        for minutes_before in &new.reminder_offsets {
            sqlx::query(
                r#"
                INSERT INTO reminders (id, switch_id, minutes_before, sent, created_at)
                VALUES (?, ?, ?, 0, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&new.id)
            .bind(minutes_before)
            .bind(new.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "Created switch: {} with {} reminders",
            switch.id,
            new.reminder_offsets.len()
        );
        Ok(switch)
    }

    /// Get a non-deleted switch by ID
    pub async fn get_switch(&self, id: &str) -> Result<Switch> {
        sqlx::query_as::<_, Switch>(
            r#"
            SELECT * FROM switches WHERE id = ? AND lifecycle = 'active'
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::SwitchNotFound(id.to_string()))
    }

    /// Get a switch by ID regardless of lifecycle (audit and purge)
    pub async fn find_switch(&self, id: &str) -> Result<Option<Switch>> {
        let switch = sqlx::query_as::<_, Switch>("SELECT * FROM switches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(switch)
    }

    /// Resolve a management token hash to its non-deleted switch
    pub async fn get_switch_by_token(&self, token_hash: &str) -> Result<Switch> {
        sqlx::query_as::<_, Switch>(
            r#"
            SELECT * FROM switches
            WHERE management_token_hash = ? AND lifecycle = 'active'
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::InvalidToken)
    }

    /// List all non-deleted switches
    pub async fn list_switches(&self) -> Result<Vec<Switch>> {
        let switches = sqlx::query_as::<_, Switch>(
            r#"
            SELECT * FROM switches
            WHERE lifecycle = 'active'
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(switches)
    }

    /// Switches the sweep must evaluate: live and not yet triggered
    pub async fn list_armed_switches(&self) -> Result<Vec<Switch>> {
        let switches = sqlx::query_as::<_, Switch>(
            r#"
            SELECT * FROM switches
            WHERE lifecycle = 'active' AND status = 'active'
            ORDER BY last_seen ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(switches)
    }

    /// Triggered switches still owing a release whose lease or retry delay has lapsed
    pub async fn list_pending_deliveries(&self, now_unix: i64) -> Result<Vec<Switch>> {
        let switches = sqlx::query_as::<_, Switch>(
            r#"
            SELECT * FROM switches
            WHERE lifecycle = 'active' AND status = 'triggered'
              AND delivery = 'pending' AND delivery_lease_until <= ?
            ORDER BY triggered_at ASC
            "#,
        )
        .bind(now_unix)
        .fetch_all(&self.pool)
        .await?;

        Ok(switches)
    }

    pub async fn count_armed_switches(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM switches WHERE lifecycle = 'active' AND status = 'active'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Record an owner check-in: move `last_seen`, bump the version and
    /// re-arm every reminder, all in one transaction.
    pub async fn check_in(&self, id: &str, now: DateTime<Utc>) -> Result<Switch> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE switches
            SET last_seen = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND status = 'active' AND lifecycle = 'active'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            let status: Option<SwitchStatus> = sqlx::query_scalar(
                "SELECT status FROM switches WHERE id = ? AND lifecycle = 'active'",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            return Err(match status {
                Some(SwitchStatus::Triggered) => AppError::AlreadyTriggered(id.to_string()),
                _ => AppError::SwitchNotFound(id.to_string()),
            });
        }

        sqlx::query("UPDATE reminders SET sent = 0, sent_at = NULL WHERE switch_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let switch = sqlx::query_as::<_, Switch>("SELECT * FROM switches WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!("Checked in switch: {} (version {})", id, switch.version);
        Ok(switch)
    }

    /// Commit the active → triggered transition if the switch is still at
    /// `expected_version`. The winner also receives the delivery lease.
    pub async fn commit_trigger(
        &self,
        id: &str,
        expected_version: i64,
        now: DateTime<Utc>,
        lease_until: i64,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE switches
            SET status = 'triggered', triggered_at = ?, delivery = 'pending',
                delivery_lease_until = ?, updated_at = ?
            WHERE id = ? AND status = 'active' AND lifecycle = 'active' AND version = ?
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(now)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 1 {
            tracing::debug!("Committed trigger for switch: {}", id);
        }
        Ok(rows == 1)
    }

    /// Take the delivery lease of a triggered switch if nobody holds it
    pub async fn claim_delivery(&self, id: &str, now_unix: i64, lease_until: i64) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE switches
            SET delivery_lease_until = ?
            WHERE id = ? AND status = 'triggered' AND lifecycle = 'active'
              AND delivery = 'pending' AND delivery_lease_until <= ?
            "#,
        )
        .bind(lease_until)
        .bind(id)
        .bind(now_unix)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    /// Record the outcome of one release attempt. Channel flags and
    /// delivered webhook targets only ever move to delivered. An incomplete
    /// release keeps the lease until its next attempt is due, backing off
    /// exponentially. Returns the new state.
    pub async fn finish_delivery_attempt(
        &self,
        id: &str,
        attempt: &DeliveryAttempt,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(DeliveryState, i64)> = sqlx::query_as(
            r#"
            UPDATE switches
            SET email_delivered = MAX(email_delivered, ?1),
                webhook_delivered = MAX(webhook_delivered, ?2),
                delivery_attempts = delivery_attempts + 1,
                delivery = CASE
                    WHEN MAX(email_delivered, ?1) = 1 AND MAX(webhook_delivered, ?2) = 1
                        THEN 'delivered'
                    WHEN delivery_attempts + 1 >= ?3 THEN 'failed'
                    ELSE 'pending'
                END,
                delivered_at = CASE
                    WHEN MAX(email_delivered, ?1) = 1 AND MAX(webhook_delivered, ?2) = 1
                        THEN ?4
                    ELSE delivered_at
                END,
                last_error = ?5,
                delivery_lease_until = 0,
                updated_at = ?4
            WHERE id = ?6 AND status = 'triggered'
            RETURNING delivery, delivery_attempts
            "#,
        )
        .bind(attempt.email_delivered)
        .bind(attempt.webhook_delivered)
        .bind(max_attempts)
        .bind(now)
        .bind(attempt.last_error.as_deref())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let (state, attempts) = row.ok_or_else(|| AppError::SwitchNotFound(id.to_string()))?;

        if state == DeliveryState::Pending {
            let retry_at = now.timestamp() + release_retry_delay_secs(attempts);
            sqlx::query("UPDATE switches SET delivery_lease_until = ? WHERE id = ?")
                .bind(retry_at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tracing::debug!("Next release attempt for switch {} at {}", id, retry_at);
        }

        for target in &attempt.delivered_webhooks {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO webhook_deliveries (switch_id, target, delivered_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(target)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!("Delivery attempt {} recorded for switch {}: {:?}", attempts, id, state);
        Ok(state)
    }

    /// Webhook sources that acknowledged an earlier release of a switch
    pub async fn list_delivered_webhooks(&self, switch_id: &str) -> Result<HashSet<String>> {
        let targets: Vec<String> =
            sqlx::query_scalar("SELECT target FROM webhook_deliveries WHERE switch_id = ?")
                .bind(switch_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(targets.into_iter().collect())
    }

    /// Park a triggered switch whose payload could not be decrypted
    pub async fn mark_undecryptable(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE switches
            SET delivery = 'undecryptable', last_error = ?, delivery_attempts = delivery_attempts + 1,
                delivery_lease_until = 0, updated_at = ?
            WHERE id = ? AND status = 'triggered'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Marked switch as undecryptable: {}", id);
        Ok(())
    }

    /// Re-open delivery of a triggered switch for an operator retry and
    /// hand the lease to the caller.
    pub async fn reopen_delivery(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_until: i64,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE switches
            SET delivery = 'pending', delivery_attempts = 0, delivery_lease_until = ?, updated_at = ?
            WHERE id = ? AND status = 'triggered' AND lifecycle = 'active'
              AND delivery IN ('pending', 'failed', 'undecryptable')
              AND delivery_lease_until <= ?
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    /// Soft delete a switch
    pub async fn soft_delete_switch(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE switches SET lifecycle = 'deleted', deleted_at = ?, updated_at = ?
            WHERE id = ? AND lifecycle = 'active'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(AppError::SwitchNotFound(id.to_string()));
        }

        tracing::debug!("Soft deleted switch: {}", id);
        Ok(())
    }

    /// Permanently delete a switch, its reminders and attachment records.
    /// Returns the storage locations that are no longer referenced by it.
    pub async fn purge_switch(&self, id: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let locations: Vec<String> =
            sqlx::query_scalar("SELECT location FROM attachments WHERE message_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        let rows = sqlx::query("DELETE FROM switches WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::SwitchNotFound(id.to_string()));
        }

        tx.commit().await?;

        tracing::debug!("Purged switch: {}", id);
        Ok(locations)
    }

    // ===== Reminders =====

    /// List reminders of a switch, earliest firing first
    pub async fn list_reminders(&self, switch_id: &str) -> Result<Vec<Reminder>> {
        let reminders = sqlx::query_as::<_, Reminder>(
            r#"
            SELECT * FROM reminders WHERE switch_id = ? ORDER BY minutes_before DESC
            "#,
        )
        .bind(switch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(reminders)
    }

    /// Claim a reminder for sending (sent 0 → 1) provided its switch is still
    /// active at `expected_version`.
    pub async fn claim_reminder(
        &self,
        reminder_id: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE reminders SET sent = 1, sent_at = ?
            WHERE id = ? AND sent = 0
              AND EXISTS (
                  SELECT 1 FROM switches s
                  WHERE s.id = reminders.switch_id
                    AND s.status = 'active' AND s.lifecycle = 'active' AND s.version = ?
              )
            "#,
        )
        .bind(now)
        .bind(reminder_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 1 {
            tracing::debug!("Claimed reminder: {}", reminder_id);
        }
        Ok(rows == 1)
    }

    // ===== Attachments =====

    /// Create an attachment record
    pub async fn create_attachment(
        &self,
        message_id: &str,
        filename: &str,
        mime_type: &str,
        size: i64,
        location: &str,
    ) -> Result<Attachment> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let attachment = sqlx::query_as::<_, Attachment>(
            r#"
            INSERT INTO attachments (id, message_id, filename, mime_type, size, location, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(message_id)
        .bind(filename)
        .bind(mime_type)
        .bind(size)
        .bind(location)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Created attachment: {} for switch: {}", id, message_id);
        Ok(attachment)
    }

    /// List live attachments for a switch
    pub async fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>> {
        let attachments = sqlx::query_as::<_, Attachment>(
            r#"
            SELECT * FROM attachments
            WHERE message_id = ? AND deleted_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attachments)
    }

    /// Number of attachment records, live or soft-deleted, pointing at a location
    pub async fn count_attachment_references(&self, location: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE location = ?")
            .bind(location)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Soft delete an attachment belonging to the given switch
    pub async fn soft_delete_attachment(&self, id: &str, message_id: &str) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE attachments SET deleted_at = ?
            WHERE id = ? AND message_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(AppError::AttachmentNotFound(id.to_string()));
        }

        tracing::debug!("Soft deleted attachment: {}", id);
        Ok(())
    }

    // ===== Settings =====

    /// Load the settings singleton, creating the empty row on first use
    pub async fn get_settings(&self) -> Result<SettingsRow> {
        sqlx::query("INSERT OR IGNORE INTO settings (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        let row = sqlx::query_as::<_, SettingsRow>("SELECT * FROM settings WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    /// Overwrite the settings singleton. Only the settings service calls this.
    pub async fn save_settings(&self, row: &SettingsRow, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO settings (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            UPDATE settings SET
                smtp_host = ?, smtp_port = ?, smtp_user = ?, smtp_pass = ?,
                smtp_from = ?, smtp_from_name = ?,
                master_password_hash = ?, recovery_key_hash = ?,
                webhook_url = ?, webhook_secret = ?, webhook_enabled = ?,
                owner_email = ?, heartbeat_token = ?, updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(&row.smtp_host)
        .bind(row.smtp_port)
        .bind(&row.smtp_user)
        .bind(&row.smtp_pass)
        .bind(&row.smtp_from)
        .bind(&row.smtp_from_name)
        .bind(&row.master_password_hash)
        .bind(&row.recovery_key_hash)
        .bind(&row.webhook_url)
        .bind(&row.webhook_secret)
        .bind(row.webhook_enabled)
        .bind(&row.owner_email)
        .bind(&row.heartbeat_token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved settings");
        Ok(())
    }

    /// Stamp the completion time of a sweep
    pub async fn record_sweep(&self, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO settings (id) VALUES (1)")
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE settings SET last_sweep_at = ? WHERE id = 1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Webhooks =====

    pub async fn create_webhook(&self, url: &str, secret: &str) -> Result<Webhook> {
        let id = Uuid::new_v4().to_string();

        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks (id, url, secret, enabled, created_at)
            VALUES (?, ?, ?, 1, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(url)
        .bind(secret)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Created webhook: {}", id);
        Ok(webhook)
    }

    pub async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let webhooks =
            sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(webhooks)
    }

    pub async fn set_webhook_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let rows = sqlx::query("UPDATE webhooks SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::WebhookNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn delete_webhook(&self, id: &str) -> Result<()> {
        let rows = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::WebhookNotFound(id.to_string()));
        }

        tracing::debug!("Deleted webhook: {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;
    use chrono::Duration;

    async fn create_test_repo() -> Repository {
        Repository::new(test_pool().await)
    }

    fn new_switch(token_hash: &str, reminders: Vec<i64>) -> NewSwitch {
        NewSwitch::new(
            "{}".to_string(),
            "fragment".to_string(),
            token_hash.to_string(),
            "recipient@example.com".to_string(),
            60,
            reminders,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_and_get_switch() {
        let repo = create_test_repo().await;

        let created = repo.create_switch(new_switch("hash-1", vec![10, 30])).await.unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.status, SwitchStatus::Active);
        assert_eq!(created.delivery, DeliveryState::None);
        assert_eq!(created.version, 0);
        assert_eq!(created.last_seen, created.created_at);

        let fetched = repo.get_switch(&created.id).await.unwrap();
        assert_eq!(fetched.recipient_email, "recipient@example.com");

        let by_token = repo.get_switch_by_token("hash-1").await.unwrap();
        assert_eq!(by_token.id, created.id);

        let reminders = repo.list_reminders(&created.id).await.unwrap();
        assert_eq!(reminders.len(), 2);
        assert_eq!(reminders[0].minutes_before, 30);
        assert!(reminders.iter().all(|r| !r.sent));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let repo = create_test_repo().await;
        let result = repo.get_switch_by_token("nope").await;
        assert!(matches!(result, Err(AppError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_token_hash_is_unique() {
        let repo = create_test_repo().await;
        repo.create_switch(new_switch("dup", vec![])).await.unwrap();
        assert!(repo.create_switch(new_switch("dup", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_check_in_rearms_reminders() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![10])).await.unwrap();
        let reminder = repo.list_reminders(&switch.id).await.unwrap().remove(0);

        assert!(repo.claim_reminder(&reminder.id, 0, Utc::now()).await.unwrap());

        let later = Utc::now() + Duration::minutes(5);
        let checked_in = repo.check_in(&switch.id, later).await.unwrap();
        assert_eq!(checked_in.version, 1);
        assert_eq!(checked_in.last_seen, later);

        let reminders = repo.list_reminders(&switch.id).await.unwrap();
        assert!(!reminders[0].sent);
        assert!(reminders[0].sent_at.is_none());
    }

    #[tokio::test]
    async fn test_claim_reminder_once() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![10])).await.unwrap();
        let reminder = repo.list_reminders(&switch.id).await.unwrap().remove(0);

        assert!(repo.claim_reminder(&reminder.id, 0, Utc::now()).await.unwrap());
        assert!(!repo.claim_reminder(&reminder.id, 0, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_reminder_stale_version() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![10])).await.unwrap();
        let reminder = repo.list_reminders(&switch.id).await.unwrap().remove(0);

        repo.check_in(&switch.id, Utc::now()).await.unwrap();

        // The sweep read version 0 before the check-in landed
        assert!(!repo.claim_reminder(&reminder.id, 0, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_trigger_is_one_way() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();
        let now = Utc::now();

        assert!(repo.commit_trigger(&switch.id, 0, now, 100).await.unwrap());
        assert!(!repo.commit_trigger(&switch.id, 0, now, 100).await.unwrap());

        let triggered = repo.get_switch(&switch.id).await.unwrap();
        assert_eq!(triggered.status, SwitchStatus::Triggered);
        assert_eq!(triggered.delivery, DeliveryState::Pending);
        assert_eq!(triggered.delivery_lease_until, 100);

        let result = repo.check_in(&switch.id, now).await;
        assert!(matches!(result, Err(AppError::AlreadyTriggered(_))));
    }

    #[tokio::test]
    async fn test_commit_trigger_loses_to_check_in() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();

        repo.check_in(&switch.id, Utc::now()).await.unwrap();

        assert!(!repo.commit_trigger(&switch.id, 0, Utc::now(), 0).await.unwrap());
        let still_active = repo.get_switch(&switch.id).await.unwrap();
        assert_eq!(still_active.status, SwitchStatus::Active);
    }

    #[tokio::test]
    async fn test_delivery_lease_and_outcome() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();
        let now = Utc::now();
        let lease_until = now.timestamp() + 300;

        repo.commit_trigger(&switch.id, 0, now, lease_until).await.unwrap();

        // Lease is held by the trigger winner
        assert!(repo.list_pending_deliveries(now.timestamp()).await.unwrap().is_empty());
        assert!(!repo.claim_delivery(&switch.id, now.timestamp(), lease_until).await.unwrap());

        let partial = DeliveryAttempt {
            email_delivered: true,
            webhook_delivered: false,
            delivered_webhooks: vec!["settings".to_string()],
            last_error: Some("webhook legacy: 503".to_string()),
        };
        let state = repo
            .finish_delivery_attempt(&switch.id, &partial, 20, now)
            .await
            .unwrap();
        assert_eq!(state, DeliveryState::Pending);

        // Held back until the retry delay has passed
        let retry_at = now.timestamp() + release_retry_delay_secs(1);
        assert!(repo.list_pending_deliveries(retry_at - 1).await.unwrap().is_empty());
        let pending = repo.list_pending_deliveries(retry_at).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].email_delivered);
        assert!(!pending[0].webhook_delivered);
        assert_eq!(
            repo.list_delivered_webhooks(&switch.id).await.unwrap(),
            HashSet::from(["settings".to_string()])
        );

        assert!(repo.claim_delivery(&switch.id, retry_at, retry_at + 300).await.unwrap());

        // A later attempt never un-delivers the email
        let rest = DeliveryAttempt {
            webhook_delivered: true,
            delivered_webhooks: vec!["settings".to_string(), "legacy".to_string()],
            ..DeliveryAttempt::default()
        };
        let state = repo
            .finish_delivery_attempt(&switch.id, &rest, 20, now)
            .await
            .unwrap();
        assert_eq!(state, DeliveryState::Delivered);

        let delivered = repo.get_switch(&switch.id).await.unwrap();
        assert!(delivered.email_delivered && delivered.webhook_delivered);
        assert_eq!(delivered.delivery_attempts, 2);
        assert!(delivered.delivered_at.is_some());
        assert!(delivered.last_error.is_none());
        assert_eq!(delivered.delivery_lease_until, 0);
        assert_eq!(repo.list_delivered_webhooks(&switch.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_attempts_back_off() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();
        let mut now = Utc::now();
        repo.commit_trigger(&switch.id, 0, now, 0).await.unwrap();

        let failed = DeliveryAttempt {
            last_error: Some("email: smtp down".to_string()),
            ..DeliveryAttempt::default()
        };

        let mut waits = Vec::new();
        for _ in 0..4 {
            let state = repo.finish_delivery_attempt(&switch.id, &failed, 20, now).await.unwrap();
            assert_eq!(state, DeliveryState::Pending);
            let stored = repo.get_switch(&switch.id).await.unwrap();
            waits.push(stored.delivery_lease_until - now.timestamp());

            now = now + chrono::Duration::seconds(stored.delivery_lease_until - now.timestamp());
            assert!(repo.claim_delivery(&switch.id, now.timestamp(), now.timestamp() + 300).await.unwrap());
        }

        assert_eq!(waits, vec![60, 120, 240, 480]);
    }

    #[tokio::test]
    async fn test_delivery_attempt_cap() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();
        let now = Utc::now();
        repo.commit_trigger(&switch.id, 0, now, 0).await.unwrap();

        let failed = DeliveryAttempt {
            last_error: Some("email: smtp down".to_string()),
            ..DeliveryAttempt::default()
        };
        let state = repo
            .finish_delivery_attempt(&switch.id, &failed, 1, now)
            .await
            .unwrap();
        assert_eq!(state, DeliveryState::Failed);

        assert!(repo.reopen_delivery(&switch.id, now, now.timestamp() + 60).await.unwrap());
        let reopened = repo.get_switch(&switch.id).await.unwrap();
        assert_eq!(reopened.delivery, DeliveryState::Pending);
        assert_eq!(reopened.delivery_attempts, 0);
    }

    #[tokio::test]
    async fn test_soft_delete_excludes_from_sweep() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();

        repo.soft_delete_switch(&switch.id, Utc::now()).await.unwrap();

        assert!(matches!(
            repo.get_switch(&switch.id).await,
            Err(AppError::SwitchNotFound(_))
        ));
        assert!(repo.list_armed_switches().await.unwrap().is_empty());
        assert!(matches!(
            repo.get_switch_by_token("h").await,
            Err(AppError::InvalidToken)
        ));

        // Audit row survives
        let audit = repo.find_switch(&switch.id).await.unwrap().unwrap();
        assert!(audit.is_deleted());
        assert!(audit.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_cascades() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![5])).await.unwrap();
        repo.create_attachment(&switch.id, "a.txt", "text/plain", 3, "ab/cd/abcd")
            .await
            .unwrap();

        let locations = repo.purge_switch(&switch.id).await.unwrap();
        assert_eq!(locations, vec!["ab/cd/abcd".to_string()]);

        assert!(repo.find_switch(&switch.id).await.unwrap().is_none());
        assert!(repo.list_reminders(&switch.id).await.unwrap().is_empty());
        assert!(repo.list_attachments(&switch.id).await.unwrap().is_empty());
        assert!(repo.list_delivered_webhooks(&switch.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attachments() {
        let repo = create_test_repo().await;
        let switch = repo.create_switch(new_switch("h", vec![])).await.unwrap();

        let attachment = repo
            .create_attachment(&switch.id, "letter.pdf", "application/pdf", 1024, "loc")
            .await
            .unwrap();
        assert_eq!(repo.list_attachments(&switch.id).await.unwrap().len(), 1);

        repo.soft_delete_attachment(&attachment.id, &switch.id).await.unwrap();
        assert!(repo.list_attachments(&switch.id).await.unwrap().is_empty());

        let again = repo.soft_delete_attachment(&attachment.id, &switch.id).await;
        assert!(matches!(again, Err(AppError::AttachmentNotFound(_))));
    }

    #[tokio::test]
    async fn test_settings_singleton() {
        let repo = create_test_repo().await;

        let empty = repo.get_settings().await.unwrap();
        assert!(empty.smtp_host.is_none());
        assert!(!empty.webhook_enabled);

        let row = SettingsRow {
            smtp_host: Some("smtp.example.com".to_string()),
            webhook_enabled: true,
            ..SettingsRow::default()
        };
        repo.save_settings(&row, Utc::now()).await.unwrap();

        let loaded = repo.get_settings().await.unwrap();
        assert_eq!(loaded.smtp_host.as_deref(), Some("smtp.example.com"));
        assert!(loaded.webhook_enabled);
        assert!(loaded.updated_at.is_some());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_webhooks() {
        let repo = create_test_repo().await;

        let hook = repo.create_webhook("https://example.com/hook", "s3cret").await.unwrap();
        assert!(hook.enabled);

        repo.set_webhook_enabled(&hook.id, false).await.unwrap();
        let hooks = repo.list_webhooks().await.unwrap();
        assert!(!hooks[0].enabled);

        repo.delete_webhook(&hook.id).await.unwrap();
        assert!(matches!(
            repo.delete_webhook(&hook.id).await,
            Err(AppError::WebhookNotFound(_))
        ));
    }
}
