//! HTTP monitoring API.
//!
//! Read-only JSON endpoints over the pool's live state, served with Axum.

pub mod v1;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::tracing::prelude::*;

pub use v1::AppState;

pub async fn serve(config: &Config, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener =
        tokio::net::TcpListener::bind((config.api.host.as_str(), config.api.port)).await?;
    info!(
        host = %config.api.host,
        port = config.api.port,
        "API listening"
    );
    axum::serve(listener, v1::routes(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("API server stopped.");
    Ok(())
}
