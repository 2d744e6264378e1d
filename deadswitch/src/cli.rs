//! CLI argument parsing structures.

use crate::config::{AppConfig, DEFAULT_SWEEP_CONCURRENCY, DEFAULT_SWEEP_INTERVAL_SECS};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Main CLI structure for deadswitch.
#[derive(Parser, Debug)]
#[command(name = "deadswitch", version)]
#[command(about = "A dead man's switch for encrypted messages", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global configuration arguments available to all commands.
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Directory holding the database and attachment blobs
    #[arg(long, global = true, env = "DEADSWITCH_DATA_DIR", default_value = "deadswitch-data")]
    pub data_dir: PathBuf,

    /// Recovery key issued by `init`; the second factor used at release time
    #[arg(long, global = true, env = "DEADSWITCH_RECOVERY_KEY", hide_env_values = true)]
    pub recovery_key: Option<String>,

    /// Seconds between sweeps when serving
    #[arg(long, global = true, env = "DEADSWITCH_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    /// Switches processed concurrently within one sweep
    #[arg(long, global = true, env = "DEADSWITCH_SWEEP_CONCURRENCY", default_value_t = DEFAULT_SWEEP_CONCURRENCY)]
    pub sweep_concurrency: usize,
}

impl ConfigArgs {
    pub fn to_app_config(&self) -> AppConfig {
        AppConfig::new(self.data_dir.clone())
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs.max(1)))
            .with_sweep_concurrency(self.sweep_concurrency)
            .with_recovery_key(self.recovery_key.clone())
    }
}

/// Master password, from the flag or the environment
#[derive(Debug, Args)]
pub struct MasterPasswordArg {
    #[arg(long, env = "DEADSWITCH_MASTER_PASSWORD", hide_env_values = true)]
    pub master_password: String,
}

/// Management token, from the flag or the environment
#[derive(Debug, Args)]
pub struct TokenArg {
    #[arg(long, env = "DEADSWITCH_TOKEN", hide_env_values = true)]
    pub token: String,
}

/// Top-level commands available in deadswitch.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// First-run setup: set the master password, print the recovery key and heartbeat token
    Init {
        #[command(flatten)]
        auth: MasterPasswordArg,
    },
    /// Run the sweep driver until interrupted
    Serve,
    /// Run one sweep and exit
    Sweep,
    /// Register a new switch
    Create {
        /// Address that receives the message when the switch triggers
        #[arg(short, long)]
        recipient: String,

        /// Minutes of silence after which the switch triggers
        #[arg(short, long)]
        duration_minutes: i64,

        /// Reminder offset in minutes before the trigger (repeatable)
        #[arg(long = "reminder")]
        reminders: Vec<i64>,

        /// Message text
        #[arg(short, long, conflicts_with = "message_file")]
        message: Option<String>,

        /// Read the message from a file
        #[arg(long, value_name = "FILE")]
        message_file: Option<PathBuf>,
    },
    /// Prove you are alive and reset the timer
    CheckIn {
        #[command(flatten)]
        token: TokenArg,
    },
    /// Show the state of a switch
    Status {
        #[command(flatten)]
        token: TokenArg,
    },
    /// Decrypt and print your own message
    Reveal {
        #[command(flatten)]
        token: TokenArg,
    },
    /// Delete a switch (it will never trigger)
    Delete {
        #[command(flatten)]
        token: TokenArg,
    },
    /// Permanently remove a switch and its attachments
    Purge {
        /// Switch identifier
        id: String,

        #[command(flatten)]
        auth: MasterPasswordArg,
    },
    /// List every live switch
    List {
        #[command(flatten)]
        auth: MasterPasswordArg,
    },
    /// Attach a file to a switch
    Attach {
        #[command(flatten)]
        token: TokenArg,

        /// File to attach
        file: PathBuf,

        /// MIME type (default: application/octet-stream)
        #[arg(long)]
        mime: Option<String>,
    },
    /// List the attachments of a switch
    Attachments {
        #[command(flatten)]
        token: TokenArg,
    },
    /// Remove an attachment from a switch
    Detach {
        #[command(flatten)]
        token: TokenArg,

        /// Attachment identifier
        attachment_id: String,
    },
    /// Manage settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Manage additional webhook targets
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
    /// Retry the release of a triggered switch whose delivery failed
    Retry {
        /// Switch identifier
        id: String,

        /// Second factor to decrypt with instead of the configured recovery key
        #[arg(long)]
        second_factor: Option<String>,

        #[command(flatten)]
        auth: MasterPasswordArg,
    },
    /// Authenticated liveness check of the service
    Heartbeat {
        #[arg(long, env = "DEADSWITCH_HEARTBEAT_TOKEN", hide_env_values = true)]
        heartbeat_token: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Show settings with secrets redacted
    Show,
    /// Change settings; an empty value clears a field
    Set {
        #[command(flatten)]
        auth: MasterPasswordArg,

        #[arg(long)]
        smtp_host: Option<String>,
        #[arg(long)]
        smtp_port: Option<u16>,
        #[arg(long)]
        smtp_user: Option<String>,
        #[arg(long)]
        smtp_pass: Option<String>,
        #[arg(long)]
        smtp_from: Option<String>,
        #[arg(long)]
        smtp_from_name: Option<String>,
        #[arg(long)]
        webhook_url: Option<String>,
        #[arg(long)]
        webhook_secret: Option<String>,
        #[arg(long)]
        webhook_enabled: Option<bool>,
        #[arg(long)]
        owner_email: Option<String>,
        #[arg(long)]
        new_master_password: Option<String>,
        /// Replace the heartbeat token and print the new one
        #[arg(long)]
        rotate_heartbeat_token: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum WebhookCommands {
    /// Register a webhook target
    Add {
        #[command(flatten)]
        auth: MasterPasswordArg,
        #[arg(long)]
        url: String,
        /// Shared secret for the HMAC signature
        #[arg(long)]
        secret: String,
    },
    /// List webhook targets
    List {
        #[command(flatten)]
        auth: MasterPasswordArg,
    },
    /// Enable a webhook target
    Enable {
        #[command(flatten)]
        auth: MasterPasswordArg,
        id: String,
    },
    /// Disable a webhook target
    Disable {
        #[command(flatten)]
        auth: MasterPasswordArg,
        id: String,
    },
    /// Remove a webhook target
    Remove {
        #[command(flatten)]
        auth: MasterPasswordArg,
        id: String,
    },
    /// Send a signed test event to every enabled target
    Test {
        #[command(flatten)]
        auth: MasterPasswordArg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "deadswitch",
            "--data-dir",
            "/tmp/ds",
            "create",
            "--recipient",
            "heir@example.com",
            "--duration-minutes",
            "1440",
            "--reminder",
            "60",
            "--reminder",
            "600",
            "--message",
            "hello",
        ])
        .unwrap();

        assert_eq!(cli.config.data_dir, PathBuf::from("/tmp/ds"));
        match cli.command {
            Commands::Create {
                duration_minutes,
                reminders,
                message,
                ..
            } => {
                assert_eq!(duration_minutes, 1440);
                assert_eq!(reminders, vec![60, 600]);
                assert_eq!(message.as_deref(), Some("hello"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_args_build_app_config() {
        let cli = Cli::try_parse_from([
            "deadswitch",
            "--recovery-key",
            "rk",
            "--sweep-interval-secs",
            "5",
            "--sweep-concurrency",
            "2",
            "sweep",
        ])
        .unwrap();

        let config = cli.config.to_app_config();
        assert_eq!(config.recovery_key.as_deref(), Some("rk"));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.sweep_concurrency, 2);
    }
}
