//! Heartbeat tracker
//!
//! Owner check-ins for individual switches, plus the liveness ping for the
//! service itself.

use crate::crypto::{hash_token, tokens_match};
use crate::database::{Repository, SwitchView};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Answer to an authenticated service heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHeartbeat {
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub armed_switches: i64,
}

#[derive(Clone)]
pub struct HeartbeatTracker {
    repo: Repository,
}

impl HeartbeatTracker {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Prove liveness for the switch owning `token`. Moves `last_seen` to
    /// `now` and re-arms every reminder.
    pub async fn check_in(&self, token: &str, now: DateTime<Utc>) -> Result<SwitchView> {
        let switch = self.repo.get_switch_by_token(&hash_token(token)).await?;
        let switch = self.repo.check_in(&switch.id, now).await?;
        let reminders = self.repo.list_reminders(&switch.id).await?;

        tracing::info!("Check-in for switch {}, next trigger at {}", switch.id, switch.trigger_at());
        Ok(SwitchView::new(&switch, &reminders))
    }

    /// Liveness ping for the service, authenticated by the settings heartbeat token
    pub async fn service_heartbeat(&self, heartbeat_token: &str) -> Result<ServiceHeartbeat> {
        let settings = self.repo.get_settings().await?;

        let authorized = settings
            .heartbeat_token
            .as_deref()
            .map(|expected| tokens_match(expected, heartbeat_token))
            .unwrap_or(false);

        if !authorized {
            tracing::warn!("Rejected service heartbeat with bad token");
            return Err(AppError::Unauthorized);
        }

        Ok(ServiceHeartbeat {
            last_sweep_at: settings.last_sweep_at,
            armed_switches: self.repo.count_armed_switches().await?,
        })
    }
}
