//! Confab SFU Library
//!
//! Media session orchestration (worker pool, per-room routers, transports,
//! producers, consumers) behind a WebSocket signaling endpoint. Exposed as a
//! library for testing and embedding.

pub mod api;
pub mod error;
pub mod sfu;
pub mod shadow;
pub mod state;
pub mod ws;

use anyhow::{Context, Result};
use confab_media::MediaEngine;
use shadow::{ShadowMirror, ShadowStateStore};
use std::sync::Arc;

/// Start the worker pool on `engine` and build the HTTP application.
///
/// Fails when the pool cannot start any worker, the one fatal condition.
pub async fn create_app(
    config: state::Config,
    engine: Arc<dyn MediaEngine>,
    store: Arc<dyn ShadowStateStore>,
) -> Result<(axum::Router, state::AppState)> {
    let shadow = ShadowMirror::new(store);
    if let Err(e) = shadow.reset().await {
        tracing::warn!(error = %e, "Failed to reset shadow state");
    }

    let pool = sfu::WorkerPool::start(engine, config.media.pool_config())
        .await
        .context("failed to start media worker pool")?;
    let app_state = state::AppState::new(&config.media, pool, shadow);
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
