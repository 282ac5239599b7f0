//! Maps the `kind` and `handler` names used in the configuration file to
//! constructors.

use async_trait::async_trait;
use log::warn;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use crate::config::WatcherConfig;
use crate::detect::{JsonDetector, RawDetector};
use crate::error::{Error, Result};
use crate::feed::{FeedParser, FeedWatcher, ItemHandler};
use crate::fetch::{Fetcher, header_map};
use crate::handlers::{Destination, FireSaleHandler, ForumUpdateHandler, LogHandler};
use crate::thread::{ForumThread, ForumThreadParser};
use crate::watcher::{DataHandler, Watcher};
use crate::webhook::Notifier;

pub const DEFAULT_ALLOWED: &[&str] = &["json", "xml", "forum-threads", "fire-sale", "log"];

/// A started-or-startable watcher, whatever its concrete type.
#[async_trait]
pub trait Watch: Send + Sync {
    fn url(&self) -> &str;

    /// Fetches whatever baseline the watcher needs before its first tick.
    async fn load_baseline(&self) {}

    /// # Errors
    ///
    /// Fails when the watcher is closed or already started.
    fn start(&self, interval: Duration) -> Result<()>;

    async fn close(&self) -> bool;
}

/// Shared collaborators handed to every factory.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub fetcher: Fetcher,
    pub notifier: Notifier,
}

impl Context {
    #[must_use]
    pub fn new(fetcher: Fetcher) -> Context {
        Context {
            notifier: Notifier::new(fetcher.clone()),
            fetcher,
        }
    }

    fn destination(&self, config: &WatcherConfig) -> Destination {
        Destination {
            notifier: self.notifier.clone(),
            webhook_url: config.webhook_url.clone(),
            mention: config.role_mention(),
        }
    }
}

pub type HandlerFactory = fn(&WatcherConfig, &Context) -> Result<Arc<dyn DataHandler>>;
pub type WatcherFactory =
    fn(&WatcherConfig, &Context, Option<Arc<dyn DataHandler>>) -> Result<Box<dyn Watch>>;

pub struct Registry {
    allowed: HashSet<String>,
    watchers: HashMap<String, WatcherFactory>,
    handlers: HashMap<String, HandlerFactory>,
}

impl Registry {
    /// An empty registry that only accepts keys from `allowed`.
    pub fn new<I, S>(allowed: I) -> Registry
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Registry {
            allowed: allowed.into_iter().map(Into::into).collect(),
            watchers: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in watcher kind and handler.
    ///
    /// # Errors
    ///
    /// Fails only if a built-in key is missing from [`DEFAULT_ALLOWED`].
    pub fn with_defaults() -> Result<Registry> {
        let mut registry = Registry::new(DEFAULT_ALLOWED.iter().copied());
        registry.register_watcher("json", json_watcher)?;
        registry.register_watcher("xml", xml_watcher)?;
        registry.register_watcher("forum-threads", forum_thread_watcher)?;
        registry.register_handler("fire-sale", fire_sale_handler)?;
        registry.register_handler("log", log_handler)?;
        Ok(registry)
    }

    /// # Errors
    ///
    /// Fails with [`Error::Registry`] for a key outside the allow-list or one
    /// that is already registered.
    pub fn register_watcher(&mut self, key: &str, factory: WatcherFactory) -> Result<()> {
        self.check_key(key, self.watchers.contains_key(key))?;
        self.watchers.insert(key.to_string(), factory);
        Ok(())
    }

    /// # Errors
    ///
    /// Same as [`Registry::register_watcher`].
    pub fn register_handler(&mut self, key: &str, factory: HandlerFactory) -> Result<()> {
        self.check_key(key, self.handlers.contains_key(key))?;
        self.handlers.insert(key.to_string(), factory);
        Ok(())
    }

    #[must_use]
    pub fn has_watcher(&self, key: &str) -> bool {
        self.watchers.contains_key(key)
    }

    #[must_use]
    pub fn has_handler(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Builds the watcher described by `config`, without starting it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Registry`] for an unknown kind or handler, or with
    /// whatever the factory rejects in `config`.
    pub fn build(&self, config: &WatcherConfig, context: &Context) -> Result<Box<dyn Watch>> {
        let factory = self
            .watchers
            .get(&config.kind)
            .ok_or_else(|| Error::Registry(format!("unknown watcher kind {:?}", config.kind)))?;

        let handler = match config.handler.as_deref() {
            Some(name) => {
                let make = self
                    .handlers
                    .get(name)
                    .ok_or_else(|| Error::Registry(format!("unknown handler {name:?}")))?;
                Some(make(config, context)?)
            }
            None => None,
        };

        factory(config, context, handler)
    }

    fn check_key(&self, key: &str, taken: bool) -> Result<()> {
        if !self.allowed.contains(key) {
            return Err(Error::Registry(format!("{key:?} is not in the allow-list")));
        }
        if taken {
            return Err(Error::Registry(format!("{key:?} is already registered")));
        }
        Ok(())
    }
}

/// A plain watcher bound to the handler it will be started with.
struct HandledWatcher {
    watcher: Watcher,
    handler: Arc<dyn DataHandler>,
    load_initial: bool,
}

#[async_trait]
impl Watch for HandledWatcher {
    fn url(&self) -> &str {
        self.watcher.url()
    }

    async fn load_baseline(&self) {
        if self.load_initial && !self.watcher.load_baseline().await {
            warn!(
                "No initial content for {}, the first tick sets the baseline",
                self.watcher.url()
            );
        }
    }

    fn start(&self, interval: Duration) -> Result<()> {
        self.watcher.start_watching(interval, self.handler.clone())
    }

    async fn close(&self) -> bool {
        self.watcher.close().await
    }
}

#[async_trait]
impl<P: FeedParser> Watch for FeedWatcher<P> {
    fn url(&self) -> &str {
        FeedWatcher::url(self)
    }

    fn start(&self, interval: Duration) -> Result<()> {
        self.start_watching(interval)
    }

    async fn close(&self) -> bool {
        FeedWatcher::close(self).await
    }
}

fn require_handler(
    config: &WatcherConfig,
    handler: Option<Arc<dyn DataHandler>>,
) -> Result<Arc<dyn DataHandler>> {
    handler.ok_or_else(|| {
        Error::Registry(format!(
            "{} watcher for {} requires a handler",
            config.kind, config.url
        ))
    })
}

fn json_watcher(
    config: &WatcherConfig,
    context: &Context,
    handler: Option<Arc<dyn DataHandler>>,
) -> Result<Box<dyn Watch>> {
    let handler = require_handler(config, handler)?;
    let watcher = Watcher::builder(&config.url)
        .headers(header_map(&config.headers)?)
        .detector(JsonDetector)
        .fetcher(context.fetcher.clone())
        .build();
    Ok(Box::new(HandledWatcher {
        watcher,
        handler,
        load_initial: config.load_initial_content,
    }))
}

fn xml_watcher(
    config: &WatcherConfig,
    context: &Context,
    handler: Option<Arc<dyn DataHandler>>,
) -> Result<Box<dyn Watch>> {
    let handler = require_handler(config, handler)?;
    let watcher = Watcher::builder(&config.url)
        .headers(header_map(&config.headers)?)
        .detector(RawDetector)
        .fetcher(context.fetcher.clone())
        .build();
    Ok(Box::new(HandledWatcher {
        watcher,
        handler,
        load_initial: config.load_initial_content,
    }))
}

fn forum_thread_watcher(
    config: &WatcherConfig,
    context: &Context,
    handler: Option<Arc<dyn DataHandler>>,
) -> Result<Box<dyn Watch>> {
    if handler.is_some() {
        return Err(Error::Registry(format!(
            "forum-threads watcher for {} posts threads itself and takes no handler",
            config.url
        )));
    }

    let threads: Arc<dyn ItemHandler<ForumThread>> =
        Arc::new(ForumUpdateHandler::new(context.destination(config)));
    Ok(Box::new(FeedWatcher::new(
        &config.url,
        header_map(&config.headers)?,
        context.fetcher.clone(),
        ForumThreadParser,
        threads,
        config.initial_guid,
    )))
}

fn fire_sale_handler(config: &WatcherConfig, context: &Context) -> Result<Arc<dyn DataHandler>> {
    Ok(Arc::new(FireSaleHandler::new(context.destination(config))))
}

fn log_handler(_config: &WatcherConfig, _context: &Context) -> Result<Arc<dyn DataHandler>> {
    Ok(Arc::new(LogHandler))
}
