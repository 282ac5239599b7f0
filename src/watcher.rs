use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::header::HeaderMap;
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    select,
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::detect::{ChangeDetector, ChangedValue, JsonDetector, RawDetector};
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, compact_line};
use crate::metrics;

/// How long `close` waits for an in-flight tick before aborting it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Callback invoked whenever a watcher observes new content.
///
/// `old` is `None` on the first observation, in which case `changes` is
/// always empty. Errors are logged by the watcher and never stop polling.
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle_data(
        &self,
        old: Option<&str>,
        new: &str,
        changes: &[ChangedValue],
    ) -> Result<()>;
}

/// Polls one URL and reports content changes to a [`DataHandler`].
///
/// A watcher moves from created to active with [`Watcher::start_watching`] and
/// ends closed after [`Watcher::close`]. Every fetch-compare-notify cycle, from
/// the schedule or from [`Watcher::watch_once`], holds the content lock for
/// its whole duration, so cycles never interleave.
///
/// Cloning yields another handle to the same watcher.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    headers: HeaderMap,
    fetcher: Fetcher,
    detector: Box<dyn ChangeDetector>,
    grace: Duration,
    last_content: AsyncMutex<Option<String>>,
    schedule: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
    closed: AtomicBool,
    token: CancellationToken,
}

pub struct WatcherBuilder {
    url: String,
    headers: HeaderMap,
    detector: Box<dyn ChangeDetector>,
    fetcher: Option<Fetcher>,
    grace: Duration,
}

impl WatcherBuilder {
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn detector<D: ChangeDetector + 'static>(mut self, detector: D) -> Self {
        self.detector = Box::new(detector);
        self
    }

    #[must_use]
    pub fn fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Builds a watcher with no baseline; its first observation reaches the
    /// handler with `old == None`.
    #[must_use]
    pub fn build(self) -> Watcher {
        Watcher {
            inner: Arc::new(Inner {
                url: self.url,
                headers: self.headers,
                fetcher: self.fetcher.unwrap_or_default(),
                detector: self.detector,
                grace: self.grace,
                last_content: AsyncMutex::new(None),
                schedule: Mutex::new(None),
                active: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Builds a watcher and seeds its baseline with one fetch. A failed fetch
    /// leaves the baseline empty.
    pub async fn build_with_baseline(self) -> Watcher {
        let watcher = self.build();
        watcher.load_baseline().await;
        watcher
    }
}

impl Watcher {
    /// Starts a builder for a watcher with no structured diff.
    pub fn builder(url: impl Into<String>) -> WatcherBuilder {
        WatcherBuilder {
            url: url.into(),
            headers: HeaderMap::new(),
            detector: Box::new(RawDetector),
            fetcher: None,
            grace: SHUTDOWN_GRACE,
        }
    }

    /// Shorthand for a builder using the [`JsonDetector`].
    pub fn json(url: impl Into<String>) -> WatcherBuilder {
        Watcher::builder(url).detector(JsonDetector)
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn last_content(&self) -> Option<String> {
        self.inner.last_content.lock().await.clone()
    }

    /// Fetches the current content as the baseline unless one is already
    /// held. Returns whether a baseline is in place afterwards.
    pub async fn load_baseline(&self) -> bool {
        let mut last_content = self.inner.last_content.lock().await;
        if last_content.is_none() {
            *last_content = self.fetch_content().await;
        }
        last_content.is_some()
    }

    pub async fn fetch_content(&self) -> Option<String> {
        self.inner
            .fetcher
            .fetch(&self.inner.url, &self.inner.headers)
            .await
    }

    /// Schedules a tick every `interval`, the first one immediately.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Config`] for a zero interval, with [`Error::Closed`]
    /// once the watcher was closed and with [`Error::AlreadyStarted`] if a
    /// schedule already exists.
    pub fn start_watching(
        &self,
        interval: Duration,
        handler: Arc<dyn DataHandler>,
    ) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "interval for {} must be greater than zero",
                self.url()
            )));
        }

        let mut schedule = self
            .inner
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(Error::Closed(self.url().to_string()));
        }
        if schedule.is_some() {
            return Err(Error::AlreadyStarted(self.url().to_string()));
        }

        let inner = self.inner.clone();
        *schedule = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    biased;
                    () = inner.token.cancelled() => break,
                    _ = ticker.tick() => inner.observe(handler.as_ref()).await,
                }
            }
            debug!("Schedule for {} finished", inner.url);
        }));

        self.inner.active.store(true, Ordering::SeqCst);
        metrics::WATCHERS_ACTIVE.inc();
        info!("Started watching {}", self.url());
        Ok(())
    }

    /// Runs a single fetch-compare-notify cycle outside the schedule. It waits
    /// for any cycle already in flight.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Closed`] once the watcher was closed.
    pub async fn watch_once(&self, handler: &dyn DataHandler) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.url().to_string()));
        }
        self.inner.observe(handler).await;
        Ok(())
    }

    /// Same as [`Watcher::close`].
    pub async fn stop_watching(&self) -> bool {
        self.close().await
    }

    /// Cancels the schedule and waits up to the shutdown grace period for an
    /// in-flight tick, aborting it afterwards.
    ///
    /// Returns `false` when the watcher was already closed.
    pub async fn close(&self) -> bool {
        let schedule = {
            let mut slot = self
                .inner
                .schedule
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return false;
            }
            slot.take()
        };

        self.inner.token.cancel();

        if let Some(mut handle) = schedule {
            if time::timeout(self.inner.grace, &mut handle).await.is_err() {
                warn!(
                    "Schedule for {} did not terminate gracefully, forcing shutdown",
                    self.url()
                );
                handle.abort();
            }
        }

        if self.inner.active.swap(false, Ordering::SeqCst) {
            metrics::WATCHERS_ACTIVE.dec();
        }
        info!("Stopped watching {}", self.url());
        true
    }
}

impl Inner {
    async fn observe(&self, handler: &dyn DataHandler) {
        let mut last_content = self.last_content.lock().await;
        let Some(new_content) = self.fetcher.fetch(&self.url, &self.headers).await else {
            return;
        };

        if self.token.is_cancelled() {
            debug!("Discarding content fetched from {} after close", self.url);
            return;
        }
        if last_content.as_deref() == Some(new_content.as_str()) {
            return;
        }

        let changes = match last_content.as_deref() {
            None => Vec::new(),
            Some(old) => match self.detector.changed_values(old, &new_content) {
                Ok(changes) => changes,
                Err(e) => {
                    if e.is_parse() {
                        metrics::record_parse_error(&self.url);
                    }
                    warn!("Skipping change from {}: {e}", self.url);
                    return;
                }
            },
        };

        debug!(
            "Watched {} and found changes! Old content: {} | New content: {}",
            self.url,
            last_content.as_deref().map(compact_line).unwrap_or_default(),
            compact_line(&new_content)
        );

        if let Err(e) = handler
            .handle_data(last_content.as_deref(), &new_content, &changes)
            .await
        {
            error!("Data handler for {} failed: {e}", self.url);
        }
        *last_content = Some(new_content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockServer, Reply, eventually};
    use serde_json::json;
    use serial_test::serial;
    use std::time::Instant;

    type Call = (Option<String>, String, Vec<ChangedValue>);

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Recorder {
                fail: true,
                ..Recorder::default()
            }
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataHandler for Recorder {
        async fn handle_data(
            &self,
            old: Option<&str>,
            new: &str,
            changes: &[ChangedValue],
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((old.map(str::to_string), new.to_string(), changes.to_vec()));
            if self.fail {
                return Err(Error::Config("handler refused".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_identical_content_never_reaches_handler() {
        let server = MockServer::start(vec![Reply::ok("same")]).await;
        let watcher = Watcher::builder(server.url()).build_with_baseline().await;
        let handler = Recorder::default();

        watcher.watch_once(&handler).await.unwrap();
        watcher.watch_once(&handler).await.unwrap();

        assert_eq!(handler.count(), 0);
        assert_eq!(watcher.last_content().await.as_deref(), Some("same"));
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn test_first_observation_sets_baseline_without_records() {
        let server = MockServer::start(vec![Reply::ok(r#"{"a":1}"#)]).await;
        let watcher = Watcher::json(server.url()).build();
        let handler = Recorder::default();

        watcher.watch_once(&handler).await.unwrap();

        assert_eq!(
            handler.calls(),
            vec![(None, r#"{"a":1}"#.to_string(), Vec::new())]
        );
        assert_eq!(watcher.last_content().await.as_deref(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_json_change_is_reported_with_records() {
        let server = MockServer::start(vec![Reply::ok(r#"{"a":1,"b":true}"#)]).await;
        let watcher = Watcher::json(server.url()).build_with_baseline().await;
        let handler = Recorder::default();

        server.set_replies(vec![Reply::ok(r#"{"a":2,"b":true}"#)]);
        watcher.watch_once(&handler).await.unwrap();

        let calls = handler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_deref(), Some(r#"{"a":1,"b":true}"#));
        assert_eq!(
            calls[0].2,
            vec![ChangedValue {
                path: "a".into(),
                old: Some(json!(1)),
                new: Some(json!(2)),
            }]
        );
        assert_eq!(
            watcher.last_content().await.as_deref(),
            Some(r#"{"a":2,"b":true}"#)
        );
    }

    #[tokio::test]
    async fn test_whitespace_only_change_still_notifies() {
        let server = MockServer::start(vec![Reply::ok("<rss/>")]).await;
        let watcher = Watcher::builder(server.url()).build_with_baseline().await;
        let handler = Recorder::default();

        server.set_replies(vec![Reply::ok("<rss />")]);
        watcher.watch_once(&handler).await.unwrap();

        let calls = handler.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_baseline() {
        let server = MockServer::start(vec![Reply::ok(r#"{"a":1}"#)]).await;
        let url = server.url();
        let watcher = Watcher::json(url.clone()).build_with_baseline().await;
        let handler = Recorder::default();

        server.set_replies(vec![Reply::ok("{broken")]);
        watcher.watch_once(&handler).await.unwrap();

        assert_eq!(handler.count(), 0);
        assert_eq!(watcher.last_content().await.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(
            metrics::PARSE_ERRORS
                .with_label_values(&[url.as_str()])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_overlapping_cycles_run_one_after_another() {
        let server = MockServer::start(vec![Reply::ok("v1")]).await;
        let watcher = Watcher::builder(server.url()).build_with_baseline().await;
        let handler = Arc::new(Recorder::default());

        server.set_replies(vec![
            Reply::ok("v2").delayed(Duration::from_millis(300)),
            Reply::ok("v3"),
        ]);
        let slow = tokio::spawn({
            let watcher = watcher.clone();
            let handler = handler.clone();
            async move { watcher.watch_once(handler.as_ref()).await }
        });
        assert!(eventually(|| server.hits() == 2).await);

        watcher.watch_once(handler.as_ref()).await.unwrap();
        slow.await.unwrap().unwrap();
        watcher.watch_once(handler.as_ref()).await.unwrap();

        let seen: Vec<(Option<String>, String)> = handler
            .calls()
            .into_iter()
            .map(|(old, new, _)| (old, new))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Some("v1".to_string()), "v2".to_string()),
                (Some("v2".to_string()), "v3".to_string()),
            ]
        );
        assert_eq!(watcher.last_content().await.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_swallowed() {
        let server = MockServer::start(vec![Reply::ok("v1")]).await;
        let watcher = Watcher::builder(server.url()).build_with_baseline().await;
        let handler = Recorder::default();

        server.set_replies(vec![Reply::status(500, "oops")]);
        watcher.watch_once(&handler).await.unwrap();

        assert_eq!(handler.count(), 0);
        assert_eq!(watcher.last_content().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_load_baseline_keeps_existing_content() {
        let server = MockServer::start(vec![Reply::status(500, "down")]).await;
        let watcher = Watcher::builder(server.url()).build();

        assert!(!watcher.load_baseline().await);
        server.set_replies(vec![Reply::ok("v1")]);
        assert!(watcher.load_baseline().await);
        server.set_replies(vec![Reply::ok("v2")]);
        assert!(watcher.load_baseline().await);

        assert_eq!(watcher.last_content().await.as_deref(), Some("v1"));
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_handler_failure_still_commits_baseline() {
        let server = MockServer::start(vec![Reply::ok("v1")]).await;
        let watcher = Watcher::builder(server.url()).build();
        let handler = Recorder::failing();

        watcher.watch_once(&handler).await.unwrap();
        watcher.watch_once(&handler).await.unwrap();

        assert_eq!(handler.count(), 1);
        assert_eq!(watcher.last_content().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    #[serial]
    async fn test_second_start_is_rejected_without_duplicate_schedule() {
        let server = MockServer::start(vec![Reply::ok("v1")]).await;
        let watcher = Watcher::builder(server.url()).build();
        let handler = Arc::new(Recorder::default());

        watcher
            .start_watching(Duration::from_millis(50), handler.clone())
            .unwrap();
        let second = watcher.start_watching(Duration::from_millis(50), handler.clone());
        assert!(matches!(second, Err(Error::AlreadyStarted(_))));

        assert!(eventually(|| handler.count() == 1).await);
        server.set_replies(vec![Reply::ok("v2")]);
        assert!(eventually(|| handler.count() == 2).await);
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handler.count(), 2);

        watcher.close().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_close_twice_decrements_gauge_once() {
        let server = MockServer::start(vec![Reply::ok("v1")]).await;
        let watcher = Watcher::builder(server.url()).build();
        let before = metrics::WATCHERS_ACTIVE.get();

        watcher
            .start_watching(Duration::from_secs(60), Arc::new(Recorder::default()))
            .unwrap();
        assert!(watcher.is_active());
        assert_eq!(metrics::WATCHERS_ACTIVE.get(), before + 1);

        assert!(watcher.close().await);
        assert!(!watcher.close().await);
        assert!(watcher.is_closed());
        assert!(!watcher.is_active());
        assert_eq!(metrics::WATCHERS_ACTIVE.get(), before);
    }

    #[tokio::test]
    #[serial]
    async fn test_closed_watcher_cannot_start() {
        let watcher = Watcher::builder("http://127.0.0.1:9/never").build();
        let before = metrics::WATCHERS_ACTIVE.get();

        assert!(watcher.stop_watching().await);
        let result = watcher.start_watching(Duration::from_secs(1), Arc::new(Recorder::default()));
        assert!(matches!(result, Err(Error::Closed(_))));
        assert!(matches!(
            watcher.watch_once(&Recorder::default()).await,
            Err(Error::Closed(_))
        ));
        assert_eq!(metrics::WATCHERS_ACTIVE.get(), before);
    }

    #[tokio::test]
    #[serial]
    async fn test_close_forces_cancellation_after_grace() {
        let server =
            MockServer::start(vec![Reply::ok("slow").delayed(Duration::from_secs(3))]).await;
        let watcher = Watcher::builder(server.url())
            .shutdown_grace(Duration::from_millis(50))
            .build();
        let handler = Arc::new(Recorder::default());

        watcher
            .start_watching(Duration::from_secs(60), handler.clone())
            .unwrap();
        assert!(eventually(|| server.hits() == 1).await);

        let started = Instant::now();
        assert!(watcher.close().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let watcher = Watcher::builder("http://127.0.0.1:9/never").build();
        let result = watcher.start_watching(Duration::ZERO, Arc::new(Recorder::default()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
