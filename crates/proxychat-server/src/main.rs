use anyhow::{Context, Result};
use proxychat_delivery::{
    DeliveryService, KeyValueStore, MemoryPresenceStore, MemoryStore, PresenceStore, RedisStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod db;
mod server;
mod telemetry;

pub use config::{ServerConfig, StoreBackend};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize telemetry
    if telemetry::json_requested() {
        telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;
    } else {
        telemetry::init_local()
            .map_err(|e| anyhow::anyhow!("Failed to init local telemetry: {}", e))?;
    }

    info!("Proxy Chat Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let server_config =
        ServerConfig::from_env().context("Failed to load server configuration")?;
    server_config.log_config();

    let store: Arc<dyn KeyValueStore> = match server_config.store {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&server_config.redis_url)
                .await
                .context("Failed to connect to Redis")?,
        ),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let presence: Arc<dyn PresenceStore> = match &server_config.database_url {
        Some(url) => Arc::new(
            db::PgPresenceStore::connect(url)
                .await
                .context("Failed to connect to presence database")?,
        ),
        None => Arc::new(MemoryPresenceStore::new()),
    };

    let instance_id = uuid::Uuid::new_v4().to_string();
    info!(instance_id = %instance_id, "Delivery service initialized");
    let delivery = DeliveryService::new(
        store,
        presence,
        server_config.delivery_config(),
        instance_id,
    );

    let stop_token = CancellationToken::new();
    let relay_handle = delivery.spawn_relay(stop_token.clone());
    tokio::spawn(watch_signals(stop_token.clone()));

    let listener = tokio::net::TcpListener::bind(server_config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.bind_addr))?;

    let state = Arc::new(server::AppState::new(delivery, stop_token.clone()));
    let result = server::start(state, listener).await;

    // The server may also stop on its own (listener error)
    stop_token.cancel();
    if let Err(e) = relay_handle.await {
        warn!("Relay task failed: {}", e);
    }

    info!("Proxy Chat Server stopped");
    result
}

/// Cancel `stop_token` on Ctrl-C or SIGTERM.
async fn watch_signals(stop_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }

    stop_token.cancel();
}
