//! Notification system for healer remediation events.
//!
//! This crate provides a fire-and-forget notification system for reporting
//! heal outcomes to webhooks, Slack or email. Delivery is best effort: a
//! failing channel is logged and never surfaces to the caller.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{HealEvent, HealOutcome, Notifier, NotifyEvent, Severity};
//!
//! # async fn example() {
//! // Create notifier from environment variables
//! let notifier = Notifier::from_env();
//!
//! // Send a notification (fire-and-forget)
//! notifier.notify(NotifyEvent::Heal(HealEvent {
//!     workload: "shop/Deployment/api".to_string(),
//!     namespace: "shop".to_string(),
//!     reason: "CrashLoop".to_string(),
//!     action: "DeletePod".to_string(),
//!     pods: vec!["api-7b9f8c6d5-abc12".to_string()],
//!     severity: Severity::Critical,
//!     outcome: HealOutcome::Success,
//!     timestamp: chrono::Utc::now(),
//! }));
//! # }
//! ```
//!
//! # Configuration
//!
//! Channels are selected with [`NotifySettings`] (usually the `[notify]`
//! table of the healer config). URLs fall back to environment variables:
//!
//! - `HEALER_WEBHOOK_URL`: generic JSON webhook
//! - `SLACK_WEBHOOK_URL`: Slack incoming webhook
//! - `SMTP_PASSWORD`: SMTP password for the email channel
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::email::{EmailChannel, SmtpSettings};
pub use channels::slack::SlackChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{HealEvent, HealOutcome, NotifyEvent, Severity};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Channel variants selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    Slack,
    Email,
}

/// Notification settings, typically the `[notify]` table of a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Enabled channels; empty means notifications are off
    #[serde(default)]
    pub channels: Vec<ChannelKind>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub smtp: Option<SmtpSettings>,
}

/// Central notification dispatcher.
///
/// The `Notifier` manages multiple notification channels and dispatches
/// events to all enabled channels in a fire-and-forget manner.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    ///
    /// Every channel whose URL variable is set gets enabled.
    #[must_use]
    pub fn from_env() -> Self {
        if env_disabled() {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let webhook = WebhookChannel::from_env();
        if webhook.enabled() {
            channels.push(Arc::new(webhook));
        }
        let slack = SlackChannel::from_env();
        if slack.enabled() {
            channels.push(Arc::new(slack));
        }

        Self::finish(channels)
    }

    /// Create a notifier from explicit settings.
    ///
    /// # Errors
    ///
    /// Returns an error when a selected channel lacks its required settings
    /// (missing URL, invalid email address, ...).
    pub fn from_settings(settings: &NotifySettings) -> Result<Self, ChannelError> {
        if env_disabled() {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Ok(Self::disabled());
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        for kind in &settings.channels {
            let channel: Arc<dyn NotifyChannel> = match kind {
                ChannelKind::Webhook => match &settings.webhook_url {
                    Some(url) => Arc::new(WebhookChannel::new(url.clone())),
                    None => require_enabled(WebhookChannel::from_env(), "webhook_url")?,
                },
                ChannelKind::Slack => match &settings.slack_webhook_url {
                    Some(url) => Arc::new(SlackChannel::new(url.clone())),
                    None => require_enabled(SlackChannel::from_env(), "slack_webhook_url")?,
                },
                ChannelKind::Email => {
                    let smtp = settings
                        .smtp
                        .clone()
                        .ok_or_else(|| ChannelError::NotConfigured("notify.smtp".to_string()))?;
                    Arc::new(EmailChannel::new(smtp)?)
                }
            };
            channels.push(channel);
        }

        Ok(Self::finish(channels))
    }

    fn finish(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            info!(
                channel_count = channels.len(),
                "Notification system initialized"
            );
        }

        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Send a notification to all enabled channels (fire-and-forget).
    ///
    /// This method spawns async tasks for each channel and returns immediately.
    /// Errors are logged but not propagated to the caller. Must be called from
    /// within a Tokio runtime.
    pub fn notify(&self, event: NotifyEvent) {
        if self.disabled {
            debug!("Notifications disabled, skipping event");
            return;
        }

        if self.channels.is_empty() {
            debug!("No channels configured, skipping event");
            return;
        }

        let event = Arc::new(event);

        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);

            tokio::spawn(async move {
                let channel_name = channel.name();

                if !channel.enabled() {
                    debug!(channel = channel_name, "Channel disabled, skipping");
                    return;
                }

                match channel.send(&event).await {
                    Ok(()) => {
                        debug!(channel = channel_name, "Notification sent");
                    }
                    Err(e) => {
                        error!(
                            channel = channel_name,
                            error = %e,
                            "Failed to send notification"
                        );
                    }
                }
            });
        }
    }

    /// Send a notification and wait for all channels to complete.
    ///
    /// Unlike `notify()`, this method waits for all notifications to be sent
    /// and collects any errors. Useful for testing or when delivery confirmation
    /// is needed.
    pub async fn notify_and_wait(
        &self,
        event: NotifyEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        if self.disabled || self.channels.is_empty() {
            return vec![];
        }

        let mut results = vec![];

        for channel in &self.channels {
            let channel_name = channel.name().to_string();
            let result = channel.send(&event).await;
            results.push((channel_name, result));
        }

        results
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_disabled() -> bool {
    std::env::var(ENV_NOTIFY_DISABLED)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn require_enabled<C: NotifyChannel + 'static>(
    channel: C,
    setting: &str,
) -> Result<Arc<dyn NotifyChannel>, ChannelError> {
    if channel.enabled() {
        Ok(Arc::new(channel))
    } else {
        Err(ChannelError::NotConfigured(format!("notify.{setting}")))
    }
}
