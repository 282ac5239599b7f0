use log::error;
use scout::{config::Config, metrics, registry::Registry, worker};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let registry = match Registry::with_defaults() {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to build registry: {e}");
            std::process::exit(1);
        }
    };

    let _metrics = metrics::spawn_server(config.scout.metrics_port);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => shutdown.cancel(),
            Err(e) => error!("Failed to listen for shutdown signal: {e}"),
        }
    });

    if let Err(e) = worker::run(config, &registry, token).await {
        error!("Scout stopped with an error: {e}");
        std::process::exit(1);
    }
}
