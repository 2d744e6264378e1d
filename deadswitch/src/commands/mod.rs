//! Command handlers behind the CLI
//!
//! This module organizes commands into logical submodules:
//! - `switches`: Create, check in, inspect, delete and purge switches
//! - `attachments`: Attachment operations
//! - `settings`: First-run setup and settings
//! - `webhooks`: Additional webhook targets
//! - `sweep`: Sweeps, the serve loop, release retries and the service heartbeat
//!
//! Every handler takes the shared `AppState` and returns a serializable
//! value that the binary prints as JSON.

pub mod attachments;
pub mod settings;
pub mod sweep;
pub mod switches;
pub mod webhooks;

use crate::app::AppState;
use crate::cli::{Commands, SettingsCommands, WebhookCommands};
use crate::database::SettingsRequest;
use crate::error::{AppError, Result};
use serde::Serialize;
use serde_json::Value;

pub use attachments::*;
pub use settings::*;
pub use sweep::*;
pub use switches::*;
pub use webhooks::*;

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn done() -> Value {
    serde_json::json!({ "ok": true })
}

/// Run one non-serving command and return its JSON output
pub async fn execute(state: &AppState, command: Commands) -> Result<Value> {
    match command {
        Commands::Init { auth } => to_json(init_settings(state, &auth.master_password).await?),
        Commands::Serve => Err(AppError::Generic(
            "`serve` runs as a long-lived process, not a one-shot command".to_string(),
        )),
        Commands::Sweep => to_json(run_sweep(state).await?),
        Commands::Create {
            recipient,
            duration_minutes,
            reminders,
            message,
            message_file,
        } => to_json(
            create_switch(
                state,
                recipient,
                duration_minutes,
                reminders,
                message,
                message_file.as_deref(),
            )
            .await?,
        ),
        Commands::CheckIn { token } => to_json(check_in(state, &token.token).await?),
        Commands::Status { token } => to_json(switch_status(state, &token.token).await?),
        Commands::Reveal { token } => to_json(reveal_switch(state, &token.token).await?),
        Commands::Delete { token } => {
            delete_switch(state, &token.token).await?;
            Ok(done())
        }
        Commands::Purge { id, auth } => {
            to_json(purge_switch(state, &auth.master_password, &id).await?)
        }
        Commands::List { auth } => to_json(list_switches(state, &auth.master_password).await?),
        Commands::Attach { token, file, mime } => {
            to_json(attach_file(state, &token.token, &file, mime.as_deref()).await?)
        }
        Commands::Attachments { token } => to_json(list_attachments(state, &token.token).await?),
        Commands::Detach {
            token,
            attachment_id,
        } => {
            remove_attachment(state, &token.token, &attachment_id).await?;
            Ok(done())
        }
        Commands::Settings { command } => execute_settings(state, command).await,
        Commands::Webhook { command } => execute_webhook(state, command).await,
        Commands::Retry {
            id,
            second_factor,
            auth,
        } => to_json(
            retry_release(state, &auth.master_password, &id, second_factor.as_deref()).await?,
        ),
        Commands::Heartbeat { heartbeat_token } => {
            to_json(service_heartbeat(state, &heartbeat_token).await?)
        }
    }
}

async fn execute_settings(state: &AppState, command: SettingsCommands) -> Result<Value> {
    match command {
        SettingsCommands::Show => to_json(get_settings(state).await?),
        SettingsCommands::Set {
            auth,
            smtp_host,
            smtp_port,
            smtp_user,
            smtp_pass,
            smtp_from,
            smtp_from_name,
            webhook_url,
            webhook_secret,
            webhook_enabled,
            owner_email,
            new_master_password,
            rotate_heartbeat_token,
        } => {
            let request = SettingsRequest {
                smtp_host,
                smtp_port,
                smtp_user,
                smtp_pass,
                smtp_from,
                smtp_from_name,
                webhook_url,
                webhook_secret,
                webhook_enabled,
                owner_email,
                new_master_password,
                rotate_heartbeat_token,
            };
            to_json(update_settings(state, &auth.master_password, request).await?)
        }
    }
}

async fn execute_webhook(state: &AppState, command: WebhookCommands) -> Result<Value> {
    match command {
        WebhookCommands::Add { auth, url, secret } => {
            to_json(add_webhook(state, &auth.master_password, &url, &secret).await?)
        }
        WebhookCommands::List { auth } => to_json(list_webhooks(state, &auth.master_password).await?),
        WebhookCommands::Enable { auth, id } => {
            set_webhook_enabled(state, &auth.master_password, &id, true).await?;
            Ok(done())
        }
        WebhookCommands::Disable { auth, id } => {
            set_webhook_enabled(state, &auth.master_password, &id, false).await?;
            Ok(done())
        }
        WebhookCommands::Remove { auth, id } => {
            remove_webhook(state, &auth.master_password, &id).await?;
            Ok(done())
        }
        WebhookCommands::Test { auth } => to_json(test_webhooks(state, &auth.master_password).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{MasterPasswordArg, TokenArg};
    use crate::config::AppConfig;
    use tempfile::TempDir;

    const PASSWORD: &str = "correct horse battery";

    async fn create_test_state() -> (AppState, TempDir) {
        let temp = TempDir::new().unwrap();
        let state = AppState::new(AppConfig::new(temp.path().join("data")))
            .await
            .unwrap();
        (state, temp)
    }

    /// Initialized state reopened with the recovery key `init` printed
    async fn initialized_state() -> (AppState, TempDir) {
        let (state, temp) = create_test_state().await;
        let init = execute(&state, Commands::Init { auth: auth() }).await.unwrap();
        let recovery_key = init["recovery_key"].as_str().unwrap().to_string();

        let config = state.config.clone().with_recovery_key(Some(recovery_key));
        drop(state);
        (AppState::new(config).await.unwrap(), temp)
    }

    fn auth() -> MasterPasswordArg {
        MasterPasswordArg {
            master_password: PASSWORD.to_string(),
        }
    }

    #[tokio::test]
    async fn test_execute_init_create_and_status() {
        let (state, _temp) = initialized_state().await;

        let created = execute(
            &state,
            Commands::Create {
                recipient: "heir@example.com".to_string(),
                duration_minutes: 60,
                reminders: vec![10],
                message: Some("the key is under the mat".to_string()),
                message_file: None,
            },
        )
        .await
        .unwrap();
        let token = created["management_token"].as_str().unwrap().to_string();

        let status = execute(
            &state,
            Commands::Status {
                token: TokenArg { token: token.clone() },
            },
        )
        .await
        .unwrap();
        assert_eq!(status["recipient_email"], "heir@example.com");
        assert!(!status.to_string().contains("under the mat"));

        let revealed = execute(&state, Commands::Reveal { token: TokenArg { token } })
            .await
            .unwrap();
        assert_eq!(revealed["message"], "the key is under the mat");
    }

    #[tokio::test]
    async fn test_execute_create_requires_message() {
        let (state, _temp) = initialized_state().await;

        let result = execute(
            &state,
            Commands::Create {
                recipient: "heir@example.com".to_string(),
                duration_minutes: 60,
                reminders: vec![],
                message: None,
                message_file: None,
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_execute_create_from_file_and_attach() {
        let (state, temp) = initialized_state().await;

        let message_file = temp.path().join("letter.txt");
        tokio::fs::write(&message_file, "from a file").await.unwrap();
        let attachment = temp.path().join("will.pdf");
        tokio::fs::write(&attachment, b"%PDF-1.4").await.unwrap();

        let created = execute(
            &state,
            Commands::Create {
                recipient: "heir@example.com".to_string(),
                duration_minutes: 60,
                reminders: vec![],
                message: None,
                message_file: Some(message_file),
            },
        )
        .await
        .unwrap();
        let token = created["management_token"].as_str().unwrap().to_string();

        let attached = execute(
            &state,
            Commands::Attach {
                token: TokenArg { token: token.clone() },
                file: attachment,
                mime: Some("application/pdf".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(attached["filename"], "will.pdf");

        let listed = execute(&state, Commands::Attachments { token: TokenArg { token } })
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_init_prints_secrets_once() {
        let (state, _temp) = create_test_state().await;

        let init = execute(&state, Commands::Init { auth: auth() }).await.unwrap();
        assert!(init["recovery_key"].is_string());
        assert!(init["heartbeat_token"].is_string());

        let again = execute(&state, Commands::Init { auth: auth() }).await;
        assert!(matches!(again, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_execute_sweep_requires_recovery_key() {
        let (state, _temp) = create_test_state().await;
        execute(&state, Commands::Init { auth: auth() }).await.unwrap();

        let result = execute(&state, Commands::Sweep).await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_execute_settings_and_webhooks_need_password() {
        let (state, _temp) = initialized_state().await;

        let wrong = MasterPasswordArg {
            master_password: "not the password".to_string(),
        };
        let result = execute(
            &state,
            Commands::Webhook {
                command: WebhookCommands::List { auth: wrong },
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Unauthorized)));

        let added = execute(
            &state,
            Commands::Webhook {
                command: WebhookCommands::Add {
                    auth: auth(),
                    url: "https://hooks.example.com/in".to_string(),
                    secret: "s3cret".to_string(),
                },
            },
        )
        .await
        .unwrap();
        assert_eq!(added["enabled"], true);

        let shown = execute(
            &state,
            Commands::Settings {
                command: SettingsCommands::Show,
            },
        )
        .await
        .unwrap();
        assert_eq!(shown["initialized"], true);
    }
}
