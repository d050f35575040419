//! Email channel using SMTP (STARTTLS).

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// SMTP settings for the email channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    /// Read from `SMTP_PASSWORD` when unset so secrets stay out of config files
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Email notification channel.
pub struct EmailChannel {
    settings: SmtpSettings,
    from: Mailbox,
    to: Vec<Mailbox>,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    /// Build the channel, validating addresses up front.
    pub fn new(mut settings: SmtpSettings) -> Result<Self, ChannelError> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| ChannelError::Email(format!("invalid from address: {e}")))?;

        let to = settings
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| ChannelError::Email(format!("invalid to address {addr}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if to.is_empty() {
            return Err(ChannelError::NotConfigured("email recipients".to_string()));
        }

        if settings.password.is_none() {
            settings.password = std::env::var("SMTP_PASSWORD").ok();
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
            .port(settings.port);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            settings,
            from,
            to,
        })
    }

    fn build_message(&self, event: &NotifyEvent) -> Result<Message, ChannelError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("[healer] {}", event.title()))
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }

        let body = format!(
            "{}\n\nSeverity: {}\nTime: {}\n",
            event.description(),
            event.severity().as_str(),
            event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
        );

        builder
            .body(body)
            .map_err(|e| ChannelError::Email(e.to_string()))
    }
}

#[async_trait]
impl NotifyChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let message = self.build_message(event)?;
        self.mailer.send(message).await?;
        debug!(
            channel = "email",
            host = %self.settings.host,
            recipients = self.to.len(),
            "Notification sent"
        );
        Ok(())
    }
}
