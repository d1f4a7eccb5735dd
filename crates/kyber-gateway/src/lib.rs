//! GatewayAPI — the HTTP control plane for the dashboard.
//!
//! Bearer-token authenticated `axum` surface exposing task visibility,
//! cancellation, redelivery, the recent-errors ring buffer, and a
//! synchronous dashboard chat turn. Grounded on the teacher's own
//! `gateway` CLI command for process wiring (it runs alongside the agent
//! loop, channel manager, cron service, and heartbeat via `tokio::select!`
//! in `kyber-cli`) and on `skynet-gateway`'s `AppState`/router/middleware
//! shape for the HTTP layer itself, which the teacher never had.

pub mod auth;
pub mod errors;
pub mod routes;
pub mod state;

mod router;

#[cfg(test)]
mod testutil;

pub use errors::{ErrorCaptureLayer, ErrorRecord, ErrorRingBuffer};
pub use router::build_router;
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

/// Bind and serve the GatewayAPI until the process is shut down.
///
/// The caller (the `gateway` CLI command) races this future inside its own
/// `tokio::select!` alongside the agent loop, channel manager, cron
/// service, and heartbeat, so a failure here surfaces the same way a
/// failure in any of those does.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> Result<()> {
    let router = build_router(state);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid gateway bind address {host}:{port}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {addr}"))?;

    info!(%addr, "gateway API listening");
    axum::serve(listener, router)
        .await
        .context("gateway API server error")?;
    Ok(())
}
