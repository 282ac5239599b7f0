//! Data handlers that turn detected changes into webhook notifications.

pub mod fire_sale;
pub mod forum_update;

use async_trait::async_trait;
use log::{info, warn};

use crate::detect::ChangedValue;
use crate::error::Result;
use crate::webhook::{Embed, Notifier};
use crate::watcher::DataHandler;

pub use fire_sale::FireSaleHandler;
pub use forum_update::ForumUpdateHandler;

/// Where a handler delivers its notifications.
#[derive(Debug, Clone, Default)]
pub struct Destination {
    pub notifier: Notifier,
    pub webhook_url: Option<String>,
    /// Rendered role mention, e.g. `<@&123>`.
    pub mention: Option<String>,
}

impl Destination {
    /// Sends to the configured webhook, or logs and skips when there is none.
    ///
    /// # Errors
    ///
    /// Propagates the [`Notifier::send`] failure.
    pub async fn send(
        &self,
        handler: &str,
        content: Option<&str>,
        embeds: Vec<Embed>,
    ) -> Result<()> {
        match &self.webhook_url {
            Some(url) => self.notifier.send(url, content, embeds).await,
            None => {
                warn!("No webhook URL configured for {handler} handler");
                Ok(())
            }
        }
    }
}

/// Logs every change record. Handy when trying out a new URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl DataHandler for LogHandler {
    async fn handle_data(
        &self,
        old: Option<&str>,
        _new: &str,
        changes: &[ChangedValue],
    ) -> Result<()> {
        if old.is_none() {
            info!("Received initial content");
            return Ok(());
        }
        if changes.is_empty() {
            info!("Content changed");
        }
        for change in changes {
            info!("Changed {change}");
        }
        Ok(())
    }
}

/// Groups digits in thousands, e.g. `1234567` becomes `1,234,567`.
pub(crate) fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        grouped.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}
