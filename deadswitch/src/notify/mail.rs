//! SMTP mail transport

use crate::config::DISPATCH_ATTEMPT_TIMEOUT;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};

/// SMTP settings resolved from the settings row
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub from_name: Option<String>,
}

/// A plain-text email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Mail collaborator. One call is one attempt.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, config: &MailConfig, email: &OutgoingEmail) -> Result<()>;
}

/// lettre-backed SMTP mailer
#[derive(Debug, Clone, Default)]
pub struct SmtpMailer;

impl SmtpMailer {
    pub fn new() -> Self {
        Self
    }

    fn transport(config: &MailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = match config.port {
            // Implicit TLS
            465 => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| AppError::dispatch("email", format!("SMTP relay: {e}")))?,
            // Local relays (mail catchers, sendmail bridges) speak plain SMTP
            25 | 1025 if is_local(&config.host) => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
            _ => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| AppError::dispatch("email", format!("SMTP relay: {e}")))?,
        };

        let mut builder = builder
            .port(config.port)
            .timeout(Some(DISPATCH_ATTEMPT_TIMEOUT));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Build the lettre message for an email
fn build_message(config: &MailConfig, email: &OutgoingEmail) -> Result<LettreMessage> {
    let from_name = config.from_name.as_deref().unwrap_or("deadswitch");
    let from_mailbox: Mailbox = format!("{from_name} <{}>", config.from)
        .parse()
        .map_err(|e| AppError::Configuration(format!("Invalid from address: {e}")))?;

    let to_mailbox: Mailbox = email
        .to
        .parse()
        .map_err(|e| AppError::dispatch("email", format!("Invalid recipient: {e}")))?;

    LettreMessage::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(email.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())
        .map_err(|e| AppError::dispatch("email", format!("Build email: {e}")))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, config: &MailConfig, email: &OutgoingEmail) -> Result<()> {
        let message = build_message(config, email)?;
        let mailer = Self::transport(config)?;

        mailer
            .send(message)
            .await
            .map_err(|e| AppError::dispatch("email", format!("SMTP send: {e}")))?;

        tracing::info!("Email sent to: {}", email.to);
        Ok(())
    }
}
