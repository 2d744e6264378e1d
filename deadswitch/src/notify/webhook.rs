//! Signed webhook transport

use crate::config::{
    DISPATCH_ATTEMPT_TIMEOUT, WEBHOOK_EVENT_HEADER, WEBHOOK_SIGNATURE_HEADER,
    WEBHOOK_TIMESTAMP_HEADER,
};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Webhook collaborator. Posts `body` to `url` signed with `secret` and
/// reports the HTTP status; non-2xx responses are errors.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn post(&self, url: &str, secret: &str, event: &str, body: &str) -> Result<u16>;
}

/// `sha256=<hex HMAC-SHA256 of body>`
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Configuration(format!("Invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// reqwest-backed webhook sender
#[derive(Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DISPATCH_ATTEMPT_TIMEOUT)
            .user_agent(concat!("deadswitch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn post(&self, url: &str, secret: &str, event: &str, body: &str) -> Result<u16> {
        let signature = sign_payload(secret, body.as_bytes())?;

        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(WEBHOOK_EVENT_HEADER, event)
            .header(WEBHOOK_TIMESTAMP_HEADER, chrono::Utc::now().timestamp().to_string())
            .header(WEBHOOK_SIGNATURE_HEADER, signature)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| AppError::dispatch("webhook", format!("POST {url} failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            tracing::info!("Webhook {} delivered to {} ({})", event, url, status.as_u16());
            Ok(status.as_u16())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(AppError::dispatch(
                "webhook",
                format!("{url} returned {status}: {}", text.chars().take(200).collect::<String>()),
            ))
        }
    }
}
