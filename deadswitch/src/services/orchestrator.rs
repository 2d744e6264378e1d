//! Switch lifecycle orchestrator
//!
//! Periodic sweep over armed switches: fire due reminders, trigger expired
//! switches exactly once, then decrypt and release. Triggered switches whose
//! release is still owed are picked up again once their delivery lease or
//! retry delay lapses. No single switch can fail the sweep.

use crate::config::{DEFAULT_SWEEP_CONCURRENCY, DELIVERY_LEASE_SECS, MAX_RELEASE_ATTEMPTS};
use crate::crypto::{self, SlotKind};
use crate::database::{
    DeliveryAttempt, DeliveryState, Repository, SettingsRow, Switch, SwitchStatus, Webhook,
};
use crate::error::{AppError, Result};
use crate::services::dispatcher::{Dispatcher, ReleasePayload, TriggerReport, WebhookResult};
use crate::services::evaluator::evaluate_switch;
use crate::services::reminders::ReminderScheduler;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Tally of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub reminders_sent: usize,
    pub reminders_failed: usize,
    pub triggered: usize,
    pub delivered: usize,
    pub delivery_pending: usize,
    pub delivery_failed: usize,
    pub undecryptable: usize,
    /// Conditional updates lost to a concurrent writer
    pub conflicts: usize,
    /// Switches whose processing hit an unexpected error
    pub errors: usize,
}

impl SweepReport {
    fn record_delivery(&mut self, state: DeliveryState) {
        match state {
            DeliveryState::Delivered => self.delivered += 1,
            DeliveryState::Pending => self.delivery_pending += 1,
            DeliveryState::Failed => self.delivery_failed += 1,
            DeliveryState::Undecryptable => self.undecryptable += 1,
            DeliveryState::None => {}
        }
    }
}

/// Result of a release attempt
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub switch_id: String,
    pub state: DeliveryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<TriggerReport>,
}

/// Inputs loaded once per sweep
struct SweepContext {
    settings: SettingsRow,
    webhooks: Vec<Webhook>,
}

#[derive(Clone)]
pub struct Orchestrator {
    repo: Repository,
    scheduler: ReminderScheduler,
    dispatcher: Dispatcher,
    recovery_key: Option<String>,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(repo: Repository, dispatcher: Dispatcher, recovery_key: Option<String>) -> Self {
        Self {
            scheduler: ReminderScheduler::new(repo.clone()),
            repo,
            dispatcher,
            recovery_key,
            concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// One full sweep at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweep_until_stopped(now, None).await
    }

    async fn sweep_until_stopped(
        &self,
        now: DateTime<Utc>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport> {
        let ctx = SweepContext {
            settings: self.repo.get_settings().await?,
            webhooks: self.repo.list_webhooks().await?,
        };
        let report = Mutex::new(SweepReport::default());
        let stopped = || shutdown.map(|rx| *rx.borrow()).unwrap_or(false);

        // Redeliveries first, so a release that fails during this sweep
        // waits for the next one
        let pending = self.repo.list_pending_deliveries(now.timestamp()).await?;
        stream::iter(pending)
            .for_each_concurrent(self.concurrency, |switch| {
                let ctx = &ctx;
                let report = &report;
                async move {
                    if stopped() {
                        return;
                    }
                    let id = switch.id.clone();
                    let mut tally = SweepReport::default();
                    if let Err(e) = self.process_pending(ctx, switch, now, &mut tally).await {
                        tracing::error!("Redelivery of switch {} failed: {}", id, e);
                        tally.errors += 1;
                    }
                    merge(report, tally);
                }
            })
            .await;

        let armed = self.repo.list_armed_switches().await?;
        stream::iter(armed)
            .for_each_concurrent(self.concurrency, |switch| {
                let ctx = &ctx;
                let report = &report;
                async move {
                    if stopped() {
                        return;
                    }
                    let id = switch.id.clone();
                    let mut tally = SweepReport::default();
                    if let Err(e) = self.process_armed(ctx, switch, now, &mut tally).await {
                        tracing::error!("Sweep of switch {} failed: {}", id, e);
                        tally.errors += 1;
                    }
                    merge(report, tally);
                }
            })
            .await;

        self.repo.record_sweep(now).await?;

        let report = report
            .into_inner()
            .map_err(|_| AppError::Generic("Sweep report lock poisoned".to_string()))?;
        tracing::info!(
            "Sweep done: {} evaluated, {} reminders, {} triggered, {} delivered",
            report.evaluated,
            report.reminders_sent,
            report.triggered,
            report.delivered
        );
        Ok(report)
    }

    /// Evaluate one armed switch: trigger it if expired, otherwise fire its
    /// due reminders.
    async fn process_armed(
        &self,
        ctx: &SweepContext,
        switch: Switch,
        now: DateTime<Utc>,
        tally: &mut SweepReport,
    ) -> Result<()> {
        let Some(evaluation) = evaluate_switch(&switch, now) else {
            return Ok(());
        };
        tally.evaluated += 1;

        if evaluation.expired {
            let lease_until = now.timestamp() + DELIVERY_LEASE_SECS;
            if !self
                .repo
                .commit_trigger(&switch.id, switch.version, now, lease_until)
                .await?
            {
                tracing::debug!("Trigger of switch {} lost to a concurrent writer", switch.id);
                tally.conflicts += 1;
                return Ok(());
            }

            tracing::info!(
                "Switch {} triggered ({}s overdue)",
                switch.id,
                evaluation.overdue_by.num_seconds()
            );
            tally.triggered += 1;

            let switch = self.repo.get_switch(&switch.id).await?;
            let outcome = self
            .deliver(ctx, &switch, self.recovery_key.as_deref(), Some(SlotKind::RecoveryKey), now)
            .await?;
            tally.record_delivery(outcome.state);
            return Ok(());
        }

        for reminder in self.scheduler.due(&switch, now).await? {
            if !self.scheduler.claim(&switch, &reminder, now).await? {
                tally.conflicts += 1;
                // A check-in moved the switch; the next sweep sees fresh state
                break;
            }

            match self
                .dispatcher
                .send_reminder(&ctx.settings, &switch, &reminder)
                .await
            {
                Ok(()) => tally.reminders_sent += 1,
                Err(e @ AppError::Configuration(_)) => {
                    tracing::warn!("Reminder {} skipped: {}", reminder.id, e);
                    tally.reminders_failed += 1;
                }
                Err(e) => {
                    tracing::error!("Reminder {} failed: {}", reminder.id, e);
                    tally.reminders_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Re-attempt the release of a triggered switch whose lease or retry delay lapsed
    async fn process_pending(
        &self,
        ctx: &SweepContext,
        switch: Switch,
        now: DateTime<Utc>,
        tally: &mut SweepReport,
    ) -> Result<()> {
        let lease_until = now.timestamp() + DELIVERY_LEASE_SECS;
        if !self
            .repo
            .claim_delivery(&switch.id, now.timestamp(), lease_until)
            .await?
        {
            tally.conflicts += 1;
            return Ok(());
        }

        tracing::info!(
            "Resuming release of switch {} (attempt {})",
            switch.id,
            switch.delivery_attempts + 1
        );

        let switch = self.repo.get_switch(&switch.id).await?;
        let outcome = self
            .deliver(ctx, &switch, self.recovery_key.as_deref(), Some(SlotKind::RecoveryKey), now)
            .await?;
        tally.record_delivery(outcome.state);
        Ok(())
    }

    /// Decrypt and release a triggered switch. The caller holds the
    /// delivery lease; the final state update clears it, or turns it into
    /// the due time of the next attempt.
    async fn deliver(
        &self,
        ctx: &SweepContext,
        switch: &Switch,
        second_factor: Option<&str>,
        hint: Option<SlotKind>,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome> {
        let plaintext = second_factor
            .ok_or_else(|| AppError::Decryption("No recovery key configured".to_string()))
            .and_then(|factor| crypto::decrypt(&switch.content, &switch.key_fragment, factor, hint));

        let message = match plaintext {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::error!("Cannot decrypt switch {}: {}", switch.id, e);
                self.repo
                    .mark_undecryptable(&switch.id, &e.to_string(), now)
                    .await?;
                return Ok(ReleaseOutcome {
                    switch_id: switch.id.clone(),
                    state: DeliveryState::Undecryptable,
                    report: None,
                });
            }
        };

        let attachments = self.repo.list_attachments(&switch.id).await?;
        let delivered_webhooks = self.repo.list_delivered_webhooks(&switch.id).await?;
        let payload = ReleasePayload {
            switch,
            message: &message,
            attachments: &attachments,
            delivered_webhooks: &delivered_webhooks,
        };
        let report = self
            .dispatcher
            .release(&ctx.settings, &ctx.webhooks, payload, now)
            .await;

        let attempt = DeliveryAttempt {
            email_delivered: report.email_done(),
            webhook_delivered: report.webhooks_done(),
            delivered_webhooks: report.delivered_webhooks(),
            last_error: report.error_summary(),
        };
        let state = self
            .repo
            .finish_delivery_attempt(&switch.id, &attempt, MAX_RELEASE_ATTEMPTS, now)
            .await?;

        match state {
            DeliveryState::Delivered => tracing::info!("Switch {} released", switch.id),
            DeliveryState::Failed => tracing::error!(
                "Giving up on release of switch {} after {} attempts",
                switch.id,
                MAX_RELEASE_ATTEMPTS
            ),
            _ => tracing::warn!(
                "Release of switch {} incomplete: {}",
                switch.id,
                attempt.last_error.as_deref().unwrap_or("unknown error")
            ),
        }

        Ok(ReleaseOutcome {
            switch_id: switch.id.clone(),
            state,
            report: Some(report),
        })
    }

    /// Operator retry of a triggered switch whose release failed or could
    /// not be decrypted, optionally with a different second factor.
    pub async fn retry_release(
        &self,
        switch_id: &str,
        second_factor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome> {
        let lease_until = now.timestamp() + DELIVERY_LEASE_SECS;
        if !self.repo.reopen_delivery(switch_id, now, lease_until).await? {
            let switch = self.repo.get_switch(switch_id).await?;
            return Err(match (switch.status, switch.delivery) {
                (SwitchStatus::Active, _) => {
                    AppError::Validation(format!("Switch {} has not triggered", switch_id))
                }
                (_, DeliveryState::Delivered) => {
                    AppError::Validation(format!("Switch {} is already delivered", switch_id))
                }
                _ => AppError::PersistenceConflict(format!(
                    "Release of switch {} is in progress elsewhere",
                    switch_id
                )),
            });
        }

        let ctx = SweepContext {
            settings: self.repo.get_settings().await?,
            webhooks: self.repo.list_webhooks().await?,
        };
        let switch = self.repo.get_switch(switch_id).await?;
        // An operator-supplied factor may open either slot
        let (factor, hint) = match second_factor {
            Some(factor) => (Some(factor), None),
            None => (self.recovery_key.as_deref(), Some(SlotKind::RecoveryKey)),
        };

        tracing::info!("Operator retry of release for switch {}", switch_id);
        self.deliver(&ctx, &switch, factor, hint, now).await
    }

    /// Signed `test` event to every enabled webhook target
    pub async fn webhook_test(&self, now: DateTime<Utc>) -> Result<Vec<WebhookResult>> {
        let settings = self.repo.get_settings().await?;
        let webhooks = self.repo.list_webhooks().await?;
        Ok(self.dispatcher.webhook_test(&settings, &webhooks, now).await)
    }

    /// Sweep every `interval` until `shutdown` flips. A sweep in progress
    /// finishes the switches it has started before the loop exits.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Sweep driver started (every {:?})", interval);
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = self.sweep_until_stopped(Utc::now(), Some(&shutdown)).await {
                        tracing::error!("Sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sweep driver stopped");
    }
}

fn merge(report: &Mutex<SweepReport>, tally: SweepReport) {
    let Ok(mut report) = report.lock() else {
        return;
    };
    report.evaluated += tally.evaluated;
    report.reminders_sent += tally.reminders_sent;
    report.reminders_failed += tally.reminders_failed;
    report.triggered += tally.triggered;
    report.delivered += tally.delivered;
    report.delivery_pending += tally.delivery_pending;
    report.delivery_failed += tally.delivery_failed;
    report.undecryptable += tally.undecryptable;
    report.conflicts += tally.conflicts;
    report.errors += tally.errors;
}
