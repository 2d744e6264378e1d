//! Outbound notification collaborators
//!
//! Mail and webhook transports behind traits so the dispatcher can be
//! driven by recording fakes in tests.

pub mod mail;
pub mod webhook;

pub use mail::{MailConfig, Mailer, OutgoingEmail, SmtpMailer};
pub use webhook::{sign_payload, HttpWebhookSender, WebhookSender};
