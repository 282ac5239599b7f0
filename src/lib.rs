//! Polls remote resources, detects what changed since the last observation and
//! forwards notifications to webhooks.
//!
//! ```text
//! tick -> Fetcher -> ChangeDetector -> Watcher -> DataHandler -> Notifier -> webhook
//! ```

pub mod config;
pub mod detect;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod thread;
pub mod watcher;
pub mod webhook;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
