//! Realtime collaboration server binary.
//!
//! Configuration comes from the environment (a `.env` file is honoured).
//! `STORAGE_PATH` selects RocksDB over the in-memory store and `REDIS_URL`
//! selects the Redis bus over the in-process one.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use scribe_collab::{
    DocumentStore, FanoutBus, Hub, LocalBus, MemoryStore, RedisBus, RocksStore, Server,
    ServerConfig, ServerError, StoreConfig,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let config = ServerConfig::from_env();
    let default_level = if config.is_production() { "info" } else { "debug" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("Starting scribe server ({})...", config.env);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), ServerError> {
    config.validate()?;

    let store: Arc<dyn DocumentStore> = match &config.storage_path {
        Some(path) => Arc::new(RocksStore::open(StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })?),
        None => {
            info!("No STORAGE_PATH set, snapshots are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let bus: Arc<dyn FanoutBus> = match &config.redis_url {
        Some(url) => Arc::new(RedisBus::connect(url).await?),
        None => {
            info!("No REDIS_URL set, fan-out is limited to this process");
            Arc::new(LocalBus::default())
        }
    };

    let hub = Arc::new(Hub::new(bus, store, config.hub_config()));
    let server = Server::bind(config, hub.clone()).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.run(shutdown).await?;

    let stats = hub.stats().snapshot();
    info!(
        "Server shut down gracefully after {} connections: {stats}",
        stats.connections_opened
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
