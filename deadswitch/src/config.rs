//! Application configuration
//!
//! Central location for configuration constants, resource limits,
//! validation boundaries and the runtime paths the service works from.

use std::path::PathBuf;
use std::time::Duration;

// ===== Switch Limits =====

/// Minimum trigger duration in minutes
pub const MIN_TRIGGER_DURATION_MINUTES: i64 = 1;

/// Maximum trigger duration in minutes (10 years)
pub const MAX_TRIGGER_DURATION_MINUTES: i64 = 10 * 365 * 24 * 60;

/// Maximum number of reminders a single switch may carry
pub const MAX_REMINDERS_PER_SWITCH: usize = 16;

/// Maximum plaintext message size in bytes (1 MiB)
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Maximum length of an email address (RFC 5321 path limit)
pub const MAX_EMAIL_LENGTH: usize = 254;

// ===== Attachment Limits =====

/// Maximum attachment size in bytes (25 MiB, a common SMTP ceiling)
pub const MAX_ATTACHMENT_BYTES: usize = 25 * 1024 * 1024;

/// Maximum stored filename length
pub const MAX_FILENAME_LENGTH: usize = 255;

// ===== Secrets =====

/// Length in bytes of generated management tokens, recovery keys and heartbeat tokens
pub const TOKEN_BYTES: usize = 32;

/// Minimum master password length
pub const MIN_MASTER_PASSWORD_LENGTH: usize = 12;

// ===== Dispatch =====

/// Upper bound for a single email or webhook attempt
pub const DISPATCH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts per channel before a dispatch is reported as failed
pub const DISPATCH_MAX_ATTEMPTS: u32 = 3;

/// Backoff unit between attempts (attempt n waits n * backoff)
pub const DISPATCH_BACKOFF: Duration = Duration::from_secs(2);

/// Default SMTP submission port
pub const DEFAULT_SMTP_PORT: u16 = 587;

// ===== Sweep =====

/// Default interval between sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default number of switches processed concurrently within one sweep
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 8;

/// Lease held on a triggered switch while its release is being delivered.
/// Channels and webhook targets are dispatched concurrently, so this must
/// exceed one channel exhausting its retries.
pub const DELIVERY_LEASE_SECS: i64 = 300;

/// Release attempts before a triggered switch is parked as failed for the operator
pub const MAX_RELEASE_ATTEMPTS: i64 = 20;

/// Wait after the first failed release attempt; doubles with every further failure
pub const RELEASE_RETRY_BASE_SECS: i64 = 60;

/// Ceiling on the wait between release attempts (6 hours)
pub const RELEASE_RETRY_MAX_SECS: i64 = 6 * 60 * 60;

/// Seconds to wait before the next release attempt once `attempts` have failed
pub fn release_retry_delay_secs(attempts: i64) -> i64 {
    let doublings = attempts.saturating_sub(1).clamp(0, 30) as u32;
    RELEASE_RETRY_BASE_SECS
        .saturating_mul(1_i64 << doublings)
        .min(RELEASE_RETRY_MAX_SECS)
}

// ===== Database =====

/// Connections in the application pool. Sweep workers, check-ins and
/// commands share it; SQLite serializes the writers.
pub const DB_POOL_SIZE: u32 = 5;

/// How long a connection waits on a locked database before failing
pub const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Header names used on outbound webhook requests
pub const WEBHOOK_SIGNATURE_HEADER: &str = "X-Deadswitch-Signature";
pub const WEBHOOK_EVENT_HEADER: &str = "X-Deadswitch-Event";
pub const WEBHOOK_TIMESTAMP_HEADER: &str = "X-Deadswitch-Timestamp";

/// Runtime configuration resolved from CLI flags and environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    pub sweep_concurrency: usize,
    /// Recovery key used as the second factor when releasing switches
    pub recovery_key: Option<String>,
}

impl AppConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
            recovery_key: None,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_concurrency(mut self, concurrency: usize) -> Self {
        self.sweep_concurrency = concurrency.max(1);
        self
    }

    pub fn with_recovery_key(mut self, recovery_key: Option<String>) -> Self {
        self.recovery_key = recovery_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("deadswitch.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}
