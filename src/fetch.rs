use log::{debug, error};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use std::{collections::BTreeMap, time::Duration, time::Instant};

use crate::error::{Error, Result};
use crate::metrics::{self, Outcome};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper around a shared [`Client`]. Cloning is cheap and every clone
/// shares the same connection pool.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// # Errors
    ///
    /// Fails when the TLS backend or the client configuration can not be initialized.
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Fetcher> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Fetcher { client })
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Issues one GET and returns the body, or `None` on any failure.
    ///
    /// The outcome and duration are recorded regardless of the result.
    pub async fn fetch(&self, url: &str, headers: &HeaderMap) -> Option<String> {
        match self.try_fetch(url, headers).await {
            Ok(content) => Some(content),
            Err(e) => {
                error!("Failed to fetch content from {url}: {e}");
                None
            }
        }
    }

    /// Same as [`Fetcher::fetch`] but surfaces the failure.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-2xx statuses and unreadable bodies.
    pub async fn try_fetch(&self, url: &str, headers: &HeaderMap) -> Result<String> {
        debug!("Fetching content from {url}");
        let start = Instant::now();

        let response = match self
            .client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::record_fetch(url, Outcome::Error, start.elapsed().as_secs_f64());
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            metrics::record_fetch(url, Outcome::Failure, start.elapsed().as_secs_f64());
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status,
            });
        }

        match response.text().await {
            Ok(content) => {
                metrics::record_fetch(url, Outcome::Success, start.elapsed().as_secs_f64());
                debug!(
                    "Successfully fetched content from {url}! (Content: {})",
                    compact_line(&content)
                );
                Ok(content)
            }
            Err(e) => {
                metrics::record_fetch(url, Outcome::Error, start.elapsed().as_secs_f64());
                Err(e.into())
            }
        }
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Fetcher::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT)
            .expect("HTTP client can not be created")
    }
}

/// Converts configured headers into a [`HeaderMap`].
///
/// # Errors
///
/// Fails with [`Error::Config`] on an invalid header name or value.
pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Collapses content onto one line for log output.
pub(crate) fn compact_line(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}
