//! Sweep driver commands

use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::services::{ReleaseOutcome, ServiceHeartbeat, SweepReport};
use chrono::Utc;
use tokio::sync::watch;

/// Refuse to sweep with a recovery key that cannot open anything
async fn require_recovery_key(state: &AppState) -> Result<()> {
    let key = state.config.recovery_key.as_deref().ok_or_else(|| {
        AppError::Configuration("No recovery key configured; set DEADSWITCH_RECOVERY_KEY".to_string())
    })?;
    state.settings_service.verify_recovery_key(key).await
}

/// One sweep at the current time
pub async fn run_sweep(state: &AppState) -> Result<SweepReport> {
    require_recovery_key(state).await?;
    state.orchestrator.sweep(Utc::now()).await
}

/// Sweep on the configured interval until `shutdown` flips
pub async fn serve(state: &AppState, shutdown: watch::Receiver<bool>) -> Result<()> {
    require_recovery_key(state).await?;
    state
        .orchestrator
        .run(state.config.sweep_interval, shutdown)
        .await;
    Ok(())
}

/// Operator retry of a failed release
pub async fn retry_release(
    state: &AppState,
    master_password: &str,
    id: &str,
    second_factor: Option<&str>,
) -> Result<ReleaseOutcome> {
    state.settings_service.authorize(master_password).await?;
    state
        .orchestrator
        .retry_release(id, second_factor, Utc::now())
        .await
}

pub async fn service_heartbeat(state: &AppState, heartbeat_token: &str) -> Result<ServiceHeartbeat> {
    state.heartbeat.service_heartbeat(heartbeat_token).await
}
