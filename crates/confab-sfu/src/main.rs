use anyhow::Result;
use confab_media::LoopbackEngine;
use confab_sfu::shadow::{MemoryShadowStore, RedisShadowStore, ShadowStateStore};
use confab_sfu::state::Config;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab_sfu=debug,confab_media=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Confab SFU...");

    // Load configuration
    let config = Config::load()?;

    // Shadow state store
    let store: Arc<dyn ShadowStateStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisShadowStore::connect(url).await?),
        None => Arc::new(MemoryShadowStore::new()),
    };

    // Start the worker pool and build the router
    let engine = Arc::new(LoopbackEngine::new());
    let (app, state) = confab_sfu::create_app(config.clone(), engine, store).await?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(
        bind_address = %config.bind_address,
        workers = config.media.num_workers,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.coordinator.shutdown().await;
    tracing::info!("Confab SFU stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
