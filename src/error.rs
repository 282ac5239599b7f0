use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] dotenvy::Error),
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: StatusCode },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Watcher for {0} has already been started")]
    AlreadyStarted(String),
    #[error("Watcher for {0} has been closed")]
    Closed(String),
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// True for errors raised by malformed content rather than transport or lifecycle problems.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self, Error::Json(_) | Error::Xml(_))
    }
}
