mod cluster;
mod config;
mod crypto;
mod delivery;
mod error;
mod handlers;
mod message;
mod registry;
mod router;
mod routes;
mod state;
mod store;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use cluster::ClusterCoordinator;
use config::{generate_config_template, Config};
use delivery::MessageSender;
use registry::ConnectionRegistry;
use store::redis::RedisStore;
use store::SharedStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "lumen_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "lumen_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("LUMEN server v{} starting", env!("CARGO_PKG_VERSION"));

    // Connect to the shared store
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    tracing::info!("Connected to shared store at {}", config.redis_url);

    // Wire the application context: one instance of everything, passed by
    // handle, no framework container.
    let registry = Arc::new(ConnectionRegistry::new());
    let delivery = MessageSender::new(store.clone(), registry.clone());
    let coordinator = ClusterCoordinator::new(store.clone(), registry.clone(), delivery.clone());
    coordinator.start().await;

    let app_state = state::AppState {
        store,
        registry,
        delivery,
        cluster: coordinator.clone(),
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
    };

    let app = routes::build_router(app_state);

    // Bind and serve. A failed bind is the one fatal startup error.
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            coordinator.shutdown().await;
        })
        .await?;

    Ok(())
}
