use std::net::SocketAddr;

use axum::{
    Router,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use lazy_static::lazy_static;
use log::{error, info};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry,
};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::error::Result;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    pub static ref URL_FETCHES: IntCounterVec = register_int_counter_vec_with_registry!(
        "scout_url_fetches_total",
        "Total URL fetch attempts",
        &["url", "status"],
        REGISTRY
    )
    .expect("metric can not be created");

    pub static ref URL_FETCH_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        HistogramOpts::new(
            "scout_url_fetch_duration_seconds",
            "URL fetch duration in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["url"],
        REGISTRY
    )
    .expect("metric can not be created");

    pub static ref WEBHOOKS_SENT: IntCounterVec = register_int_counter_vec_with_registry!(
        "scout_webhooks_sent_total",
        "Total webhook messages sent",
        &["status"],
        REGISTRY
    )
    .expect("metric can not be created");

    pub static ref DATA_CHANGES_DETECTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "scout_data_changes_total",
        "Total data changes detected by handlers",
        &["handler"],
        REGISTRY
    )
    .expect("metric can not be created");

    pub static ref PARSE_ERRORS: IntCounterVec = register_int_counter_vec_with_registry!(
        "scout_parse_errors_total",
        "Fetched documents that could not be parsed",
        &["url"],
        REGISTRY
    )
    .expect("metric can not be created");

    pub static ref WATCHERS_ACTIVE: IntGauge = register_int_gauge_with_registry!(
        "scout_watchers_active",
        "Number of active watchers",
        REGISTRY
    )
    .expect("metric can not be created");
}

/// Outcome label shared by the fetch and webhook counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The peer answered with a non-2xx status.
    Failure,
    /// Transport-level error or timeout.
    Error,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Error => "error",
        }
    }
}

pub fn record_fetch(url: &str, outcome: Outcome, elapsed_secs: f64) {
    URL_FETCH_DURATION
        .with_label_values(&[url])
        .observe(elapsed_secs);
    URL_FETCHES
        .with_label_values(&[url, outcome.as_str()])
        .inc();
}

pub fn record_webhook(outcome: Outcome) {
    WEBHOOKS_SENT.with_label_values(&[outcome.as_str()]).inc();
}

pub fn record_data_change(handler: &str) {
    DATA_CHANGES_DETECTED.with_label_values(&[handler]).inc();
}

pub fn record_parse_error(url: &str) {
    PARSE_ERRORS.with_label_values(&[url]).inc();
}

/// Encodes every registered metric in the Prometheus text format.
///
/// # Errors
///
/// Fails when a metric family can not be encoded.
pub fn render() -> Result<String> {
    let families = REGISTRY.gather();
    Ok(TextEncoder::new().encode_to_string(&families)?)
}

/// Serves `GET /metrics` on all interfaces. A port of 0 disables the server.
#[must_use]
pub fn spawn_server(port: u16) -> Option<JoinHandle<()>> {
    if port == 0 {
        return None;
    }

    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    Some(tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Metrics server listening on {addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    error!("Metrics server exited with error: {e}");
                }
            }
            Err(e) => error!("Failed to bind metrics listener on {addr}: {e}"),
        }
    }))
}

async fn metrics_handler() -> Response {
    match render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}
