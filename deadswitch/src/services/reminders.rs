//! Reminder scheduler
//!
//! Decides which pre-trigger reminders are due and claims them exactly once.
//! A reminder with `minutes_before = m` is due from `trigger_at - m` onward;
//! `sent` is the only gate once it flips, so a clock that moves backwards
//! never causes a resend. Check-ins re-arm reminders (see `heartbeat`).

use crate::config::MAX_REMINDERS_PER_SWITCH;
use crate::database::{Reminder, Repository, Switch};
use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};

/// Instant from which a reminder is due
pub fn reminder_due_at(switch: &Switch, reminder: &Reminder) -> DateTime<Utc> {
    switch.trigger_at() - Duration::minutes(reminder.minutes_before)
}

/// Every unsent reminder of `switch` that is due at `now`. Reminders whose
/// window already passed are included; they fire late rather than never.
pub fn due_reminders<'a>(
    switch: &Switch,
    reminders: &'a [Reminder],
    now: DateTime<Utc>,
) -> Vec<&'a Reminder> {
    reminders
        .iter()
        .filter(|r| r.switch_id == switch.id)
        .filter(|r| !r.sent && now >= reminder_due_at(switch, r))
        .collect()
}

/// Validate and normalise reminder offsets for a new switch: deduplicated,
/// earliest-firing first, each in `0..trigger_duration_minutes`.
pub fn normalize_offsets(trigger_duration_minutes: i64, offsets: &[i64]) -> Result<Vec<i64>> {
    let mut normalized: Vec<i64> = offsets.to_vec();
    normalized.sort_unstable_by(|a, b| b.cmp(a));
    normalized.dedup();

    if normalized.len() > MAX_REMINDERS_PER_SWITCH {
        return Err(AppError::Validation(format!(
            "At most {} reminders per switch",
            MAX_REMINDERS_PER_SWITCH
        )));
    }

    if let Some(bad) = normalized
        .iter()
        .find(|m| **m < 0 || **m >= trigger_duration_minutes)
    {
        return Err(AppError::Validation(format!(
            "Reminder offset {} must be between 0 and {} minutes",
            bad,
            trigger_duration_minutes - 1
        )));
    }

    Ok(normalized)
}

/// Reminder scheduler bound to the repository
#[derive(Clone)]
pub struct ReminderScheduler {
    repo: Repository,
}

impl ReminderScheduler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// List all reminders of a switch
    pub async fn list(&self, switch_id: &str) -> Result<Vec<Reminder>> {
        self.repo.list_reminders(switch_id).await
    }

    /// Load the reminders of `switch` and return those due at `now`
    pub async fn due(&self, switch: &Switch, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let reminders = self.repo.list_reminders(&switch.id).await?;
        Ok(due_reminders(switch, &reminders, now)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Mark a reminder sent, provided nobody else did and the owner has not
    /// checked in since `switch` was read. Returns whether this caller owns
    /// the send.
    pub async fn claim(&self, switch: &Switch, reminder: &Reminder, now: DateTime<Utc>) -> Result<bool> {
        let claimed = self
            .repo
            .claim_reminder(&reminder.id, switch.version, now)
            .await?;

        if !claimed {
            tracing::debug!(
                "Reminder {} of switch {} already claimed or switch changed",
                reminder.id,
                switch.id
            );
        }
        Ok(claimed)
    }
}
