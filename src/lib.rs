//! DriftSentinel -- drift detection and incident resolution for algorithmic
//! decision streams.
//!
//! Decisions are ingested into SQLite, compared against per-algorithm
//! baselines by KL divergence, and drifting algorithms get an incident that
//! is diagnosed, remediated under a confidence policy, and reported to chat
//! and ticketing channels.

pub mod api;
pub mod baseline;
pub mod config;
pub mod detect;
pub mod diagnosis;
pub mod error;
pub mod ingest;
pub mod resolution;
pub mod scheduler;
pub mod sentinel;
pub mod simulate;
pub mod storage;
pub mod workflow;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::SentinelConfig;
use crate::sentinel::Sentinel;

/// Start the daemon: background scanner, follow-up pipeline, and HTTP API.
///
/// Returns after Ctrl-C once in-flight work has drained (bounded).
pub async fn serve(config: SentinelConfig) -> Result<()> {
    tracing::info!(db_path = %config.storage.db_path.display(), "initializing database");
    let sentinel = Arc::new(Sentinel::open(config)?);
    sentinel.start()?;

    let bind = &sentinel.config().server.bind;
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let app = api::router(api::state::AppState::new(sentinel.clone()));

    tracing::info!(%addr, "DriftSentinel listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    sentinel.shutdown(Duration::from_secs(30)).await;
    Ok(())
}
