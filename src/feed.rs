//! Exactly-once delivery of items from an ordered feed.
//!
//! Every item carries an identifier that the source hands out in strictly
//! increasing order. A [`Watermark`] remembers the highest identifier already
//! delivered, so refetching overlapping pages never replays an item.

use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::header::HeaderMap;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::watch;

use crate::detect::{ChangedValue, RawDetector};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::metrics;
use crate::watcher::{DataHandler, Watcher};

pub trait FeedItem {
    fn id(&self) -> u64;
}

pub trait FeedParser: Send + Sync + 'static {
    type Item: FeedItem + Send + Sync;

    fn parse(&self, content: &str) -> Result<Vec<Self::Item>>;
}

#[async_trait]
pub trait ItemHandler<T>: Send + Sync {
    async fn handle_item(&self, item: &T) -> Result<()>;
}

/// Highest identifier seen so far. Only ever moves up.
#[derive(Debug, Default)]
pub struct Watermark {
    value: AtomicU64,
    seeded: AtomicBool,
}

impl Watermark {
    /// A seed of zero means "not seeded yet".
    #[must_use]
    pub fn new(seed: u64) -> Watermark {
        Watermark {
            value: AtomicU64::new(seed),
            seeded: AtomicBool::new(seed > 0),
        }
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::SeqCst)
    }

    /// Raises the watermark to at least `max` and marks it seeded.
    pub fn seed(&self, max: u64) {
        self.value.fetch_max(max, Ordering::SeqCst);
        self.seeded.store(true, Ordering::SeqCst);
    }

    /// Compare-and-raise. Returns the previous value when `candidate` was
    /// strictly above it and this call moved the watermark, `None` otherwise.
    pub fn try_raise(&self, candidate: u64) -> Option<u64> {
        self.value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (candidate > current).then_some(candidate)
            })
            .ok()
    }
}

/// Applies the watermark algorithm to parsed feed content.
pub struct FeedTracker<P: FeedParser> {
    url: String,
    parser: P,
    handler: Arc<dyn ItemHandler<P::Item>>,
    watermark: Watermark,
}

impl<P: FeedParser> FeedTracker<P> {
    pub fn new(
        url: impl Into<String>,
        parser: P,
        handler: Arc<dyn ItemHandler<P::Item>>,
        seed: u64,
    ) -> FeedTracker<P> {
        FeedTracker {
            url: url.into(),
            parser,
            handler,
            watermark: Watermark::new(seed),
        }
    }

    #[must_use]
    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    /// Processes one fetched document and returns how many items were delivered.
    ///
    /// Before the watermark is seeded the document only seeds it. Afterwards
    /// every item above the watermark is delivered once, in ascending order.
    pub async fn ingest(&self, content: &str) -> usize {
        let Some(mut items) = self.parse(content) else {
            return 0;
        };

        if !self.watermark.is_seeded() {
            self.seed_from(&items);
            return 0;
        }

        items.sort_by_key(FeedItem::id);
        let mut delivered = 0;
        for item in &items {
            let Some(previous) = self.watermark.try_raise(item.id()) else {
                continue;
            };
            debug!(
                "Watched {} and found newest id! Old: {previous} - New: {}",
                self.url,
                item.id()
            );
            delivered += 1;
            if let Err(e) = self.handler.handle_item(item).await {
                error!("Item handler for {} failed on id {}: {e}", self.url, item.id());
            }
        }
        delivered
    }

    /// Seeds the watermark from a document without delivering anything.
    /// Returns whether the watermark is seeded afterwards.
    pub fn seed(&self, content: &str) -> bool {
        if let Some(items) = self.parse(content) {
            self.seed_from(&items);
        }
        self.watermark.is_seeded()
    }

    fn seed_from(&self, items: &[P::Item]) {
        if let Some(max) = items.iter().map(FeedItem::id).max() {
            self.watermark.seed(max);
            debug!("Seeded watermark for {} at {}", self.url, self.watermark.get());
        }
    }

    fn parse(&self, content: &str) -> Option<Vec<P::Item>> {
        if content.trim().is_empty() {
            return None;
        }
        match self.parser.parse(content) {
            Ok(items) if items.is_empty() => None,
            Ok(items) => Some(items),
            Err(e) => {
                metrics::record_parse_error(&self.url);
                warn!("Failed to parse feed from {}: {e}", self.url);
                None
            }
        }
    }
}

#[async_trait]
impl<P: FeedParser> DataHandler for FeedTracker<P> {
    async fn handle_data(
        &self,
        _old: Option<&str>,
        new: &str,
        _changes: &[ChangedValue],
    ) -> Result<()> {
        self.ingest(new).await;
        Ok(())
    }
}

/// A raw-content [`Watcher`] that delivers new feed items instead of whole
/// documents.
///
/// Unless a seed of at least 1 is supplied, construction spawns one baseline
/// fetch that seeds the watermark. Starting the schedule waits for that fetch
/// to finish, whether it succeeded or not.
pub struct FeedWatcher<P: FeedParser> {
    watcher: Watcher,
    tracker: Arc<FeedTracker<P>>,
    baseline: watch::Receiver<bool>,
    start_requested: AtomicBool,
}

impl<P: FeedParser> FeedWatcher<P> {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        url: impl Into<String>,
        headers: HeaderMap,
        fetcher: Fetcher,
        parser: P,
        handler: Arc<dyn ItemHandler<P::Item>>,
        seed: u64,
    ) -> FeedWatcher<P> {
        let url = url.into();
        let watcher = Watcher::builder(url.clone())
            .headers(headers)
            .detector(RawDetector)
            .fetcher(fetcher)
            .build();
        let tracker = Arc::new(FeedTracker::new(url, parser, handler, seed));

        let (done, baseline) = watch::channel(tracker.watermark().is_seeded());
        if !tracker.watermark().is_seeded() {
            let watcher = watcher.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                match watcher.fetch_content().await {
                    Some(content) if tracker.seed(&content) => {}
                    _ => warn!(
                        "Failed to seed baseline for {}, the first tick will seed it",
                        watcher.url()
                    ),
                }
                done.send_replace(true);
            });
        }

        FeedWatcher {
            watcher,
            tracker,
            baseline,
            start_requested: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.watcher.url()
    }

    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.tracker.watermark().get()
    }

    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.tracker.watermark().is_seeded()
    }

    #[must_use]
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// Resolves once the baseline fetch has finished.
    pub async fn baseline_ready(&self) {
        let mut baseline = self.baseline.clone();
        // a dropped sender means the seeding task is gone, treat it as done
        let _ = baseline.wait_for(|done| *done).await;
    }

    /// Requests the recurring schedule. The request is queued behind the
    /// baseline fetch; the caller does not wait for it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Closed`] after close and with
    /// [`Error::AlreadyStarted`] on a second request.
    pub fn start_watching(&self, interval: Duration) -> Result<()> {
        if self.watcher.is_closed() {
            return Err(Error::Closed(self.url().to_string()));
        }
        if self
            .start_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted(self.url().to_string()));
        }

        let watcher = self.watcher.clone();
        let tracker: Arc<dyn DataHandler> = self.tracker.clone();
        let mut baseline = self.baseline.clone();
        tokio::spawn(async move {
            let _ = baseline.wait_for(|done| *done).await;
            if let Err(e) = watcher.start_watching(interval, tracker) {
                debug!("Skipping start for {}: {e}", watcher.url());
            }
        });
        Ok(())
    }

    /// Runs one tick once the baseline fetch is done.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Closed`] after close.
    pub async fn watch_once(&self) -> Result<()> {
        self.baseline_ready().await;
        self.watcher.watch_once(self.tracker.as_ref()).await
    }

    pub async fn close(&self) -> bool {
        self.watcher.close().await
    }
}
