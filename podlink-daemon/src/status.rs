//! Tiny `axum` health/status endpoint the daemon exposes alongside its
//! routers, in place of `nyx-daemon::main`'s `tonic` control API.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router as AxumRouter};
use podlink_chain::Router;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
struct AppState {
    routers: Vec<Arc<Router>>,
}

#[derive(Serialize)]
struct RouterStatus {
    addr: String,
}

#[derive(Serialize)]
struct StatusResponse {
    routers: Vec<RouterStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let routers = state.routers.iter().map(|r| RouterStatus { addr: r.addr().to_string() }).collect();
    Json(StatusResponse { routers })
}

/// Serves `/healthz` and `/status` on `addr` until the process exits.
pub async fn serve(addr: &str, routers: Vec<Arc<Router>>) -> anyhow::Result<()> {
    let app = AxumRouter::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(AppState { routers });

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
