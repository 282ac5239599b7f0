use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env::VarError,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::error::{Error, Result};

const CONFIG_ENV: &str = "SCOUT_CONFIG";
const WEBHOOK_ENV: &str = "WEBHOOK_URL";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scout: ScoutOptions,
    #[serde(default)]
    pub watchers: Vec<WatcherConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScoutOptions {
    pub metrics_port: u16,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub webhook_url: Option<String>,
}

impl Default for ScoutOptions {
    fn default() -> Self {
        ScoutOptions {
            metrics_port: 9192,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub handler: Option<String>,
    pub webhook_url: Option<String>,
    pub alert_role_id: Option<String>,
    #[serde(default)]
    pub initial_guid: u64,
    /// Fetch a baseline before the first tick so startup content is not
    /// reported as a change.
    #[serde(default = "default_true")]
    pub load_initial_content: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

impl WatcherConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Role mention prefix, `None` when no role is configured.
    #[must_use]
    pub fn role_mention(&self) -> Option<String> {
        self.alert_role_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| format!("<@&{id}>"))
    }
}

impl Config {
    /// Loads the configuration from `$SCOUT_CONFIG`, or from
    /// `<config dir>/scout/config.toml` when the variable is not set.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_path`], plus failures reading the environment.
    pub fn load() -> Result<Config> {
        Config::from_path(default_path()?)
    }

    /// # Errors
    ///
    /// Fails when the file can not be read or [`Config::from_toml_str`] rejects it.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
        let content = fs::read_to_string(path)?;
        Config::from_toml_str(&content)
    }

    /// Parses, fills in the webhook fallbacks and validates.
    ///
    /// # Errors
    ///
    /// Fails on malformed TOML, invalid URLs, zero intervals or timeouts, and
    /// unreadable environment variables.
    pub fn from_toml_str(content: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(content)?;

        // if webhook_url is not set use env with dotenvy
        if config.scout.webhook_url.is_none() {
            config.scout.webhook_url = env_var(WEBHOOK_ENV)?;
        }

        // every watcher without its own webhook inherits the global one
        for watcher in &mut config.watchers {
            if watcher.webhook_url.is_none() {
                watcher.webhook_url.clone_from(&config.scout.webhook_url);
            }
        }

        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.scout.timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.scout.connect_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.scout.timeout_secs == 0 || self.scout.connect_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be at least one second".into()));
        }
        if let Some(webhook) = &self.scout.webhook_url {
            Url::parse(webhook)?;
        }

        for watcher in &self.watchers {
            Url::parse(&watcher.url)?;
            if let Some(webhook) = &watcher.webhook_url {
                Url::parse(webhook)?;
            }
            if watcher.interval_secs == 0 {
                return Err(Error::Config(format!(
                    "interval_secs for {} must be at least 1",
                    watcher.url
                )));
            }
        }
        Ok(())
    }
}

/// Reads `name` through dotenvy. An unset variable is `None`, an unreadable
/// one is an error.
fn env_var(name: &str) -> Result<Option<String>> {
    match dotenvy::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(dotenvy::Error::EnvVar(VarError::NotPresent)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn default_path() -> Result<PathBuf> {
    if let Some(path) = env_var(CONFIG_ENV)? {
        return Ok(PathBuf::from(path));
    }

    dirs::config_dir()
        .map(|dir| dir.join("scout").join("config.toml"))
        .ok_or_else(|| Error::Config("could not determine the config directory".into()))
}
