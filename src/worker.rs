use log::{error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, WatcherConfig};
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::registry::{Context, Registry, Watch};

/// Starts every enabled watcher and keeps them polling until `token` is cancelled.
///
/// # Behavior
///
/// - Builds each enabled watcher through the `registry`
/// - A watcher that fails to build or start is logged and skipped, the others keep running
/// - On cancellation every running watcher is closed concurrently, each bounded
///   by its shutdown grace period
///
/// # Errors
///
/// Fails only if the shared HTTP client cannot be built.
pub async fn run(config: Config, registry: &Registry, token: CancellationToken) -> Result<()> {
    let fetcher = Fetcher::new(config.connect_timeout(), config.timeout())?;
    let context = Context::new(fetcher);

    // Initial configuration logging
    info!("Starting scout...");
    info!("Request timeout: {} seconds", config.scout.timeout_secs);
    if config.scout.webhook_url.is_none() {
        warn!("No default webhook is set, only watchers with their own webhook will notify");
    }

    let mut running: Vec<Box<dyn Watch>> = Vec::new();
    for watcher_config in config.watchers.iter().filter(|w| w.enabled) {
        match start_watcher(registry, watcher_config, &context).await {
            Ok(watch) => running.push(watch),
            Err(e) => error!("Failed to start watcher for {}: {e}", watcher_config.url),
        }
    }

    if running.is_empty() {
        warn!("No watchers running");
    } else {
        info!("Watching {} URLs", running.len());
    }

    token.cancelled().await;
    info!("Shutdown requested, stopping watchers");

    let mut closing = JoinSet::new();
    for watch in running {
        closing.spawn(async move {
            watch.close().await;
        });
    }
    while closing.join_next().await.is_some() {}

    // Cleanup and shutdown
    info!("All watchers stopped gracefully");
    Ok(())
}

async fn start_watcher(
    registry: &Registry,
    config: &WatcherConfig,
    context: &Context,
) -> Result<Box<dyn Watch>> {
    let watch = registry.build(config, context)?;
    watch.load_baseline().await;
    info!(
        "Starting {} watcher on {} (interval={}s)",
        config.kind, config.url, config.interval_secs
    );
    watch.start(config.interval())?;
    Ok(watch)
}
