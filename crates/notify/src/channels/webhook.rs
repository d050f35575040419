//! Generic JSON webhook channel.
//!
//! Posts the serialized [`NotifyEvent`] as-is, so any receiver that accepts
//! JSON (an internal incident API, an n8n flow, ...) can consume heal events.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the webhook URL.
const ENV_WEBHOOK_URL: &str = "HEALER_WEBHOOK_URL";

/// Plain JSON webhook channel.
pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a new webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let url = std::env::var(ENV_WEBHOOK_URL).ok();
        if url.is_none() {
            debug!("Webhook notifications disabled (HEALER_WEBHOOK_URL not set)");
        }
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a webhook channel posting to `url`.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url: Some(url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_WEBHOOK_URL.to_string()))?;

        let response = self.client.post(url).json(event).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(channel = "webhook", workload = event.workload(), "Event delivered");
            return Ok(());
        }

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "webhook", status = %status, body = %body, "Webhook request failed");
        Err(ChannelError::Other(format!("webhook returned {status}: {body}")))
    }
}
