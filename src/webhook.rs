use chrono::{SecondsFormat, Utc};
use log::{debug, error};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::metrics::{self, Outcome};

pub const GREEN: u32 = 0x00_FF_00;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WebhookMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl WebhookMessage {
    /// Blank content is dropped rather than sent as an empty string.
    #[must_use]
    pub fn new(content: Option<&str>, embeds: Vec<Embed>) -> WebhookMessage {
        WebhookMessage {
            content: content
                .filter(|c| !c.trim().is_empty())
                .map(str::to_string),
            embeds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl Embed {
    /// Creates an embed stamped with the current time.
    #[must_use]
    pub fn new(
        title: Option<&str>,
        url: Option<&str>,
        description: Option<&str>,
        color: u32,
    ) -> Embed {
        Embed {
            title: title.map(str::to_string),
            url: url.map(str::to_string),
            description: description.map(str::to_string),
            color: color & 0x00FF_FFFF,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            fields: Vec::new(),
        }
    }

    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        inline: bool,
    ) -> &mut Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }
}

/// Posts [`WebhookMessage`]s to Discord-style webhook URLs.
///
/// Sends are best effort: every outcome is logged and counted, nothing is retried.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    fetcher: Fetcher,
}

impl Notifier {
    #[must_use]
    pub fn new(fetcher: Fetcher) -> Notifier {
        Notifier { fetcher }
    }

    /// Posts `content` and `embeds` once.
    ///
    /// # Errors
    ///
    /// Fails on transport errors and on any non-2xx response.
    pub async fn send(
        &self,
        webhook_url: &str,
        content: Option<&str>,
        embeds: Vec<Embed>,
    ) -> Result<()> {
        self.post(webhook_url, &WebhookMessage::new(content, embeds))
            .await
    }

    /// Plain-text shorthand for [`Notifier::send`].
    ///
    /// # Errors
    ///
    /// Same as [`Notifier::send`].
    pub async fn send_message(&self, webhook_url: &str, content: &str) -> Result<()> {
        self.post(webhook_url, &WebhookMessage::new(Some(content), Vec::new()))
            .await
    }

    async fn post(&self, webhook_url: &str, payload: &WebhookMessage) -> Result<()> {
        let response = match self
            .fetcher
            .client()
            .post(webhook_url)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::record_webhook(Outcome::Error);
                error!("Failed to send webhook to {webhook_url}: {e}");
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            metrics::record_webhook(Outcome::Success);
            debug!("Successfully sent webhook to {webhook_url}");
            Ok(())
        } else {
            metrics::record_webhook(Outcome::Failure);
            error!(
                "Failed to send webhook to {webhook_url}: HTTP {} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown")
            );
            Err(Error::HttpStatus {
                url: webhook_url.to_string(),
                status,
            })
        }
    }
}
