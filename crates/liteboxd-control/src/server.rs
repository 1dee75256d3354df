// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server for the control plane.
//!
//! Public routes live under `/api/v1`; lookups for the access gateway live
//! under `/internal/v1` and are expected to be reachable only from inside
//! the cluster.

use std::net::SocketAddr;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, AppState};

/// Build the complete router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/sandboxes",
            get(handlers::list_sandboxes).post(handlers::create_sandbox),
        )
        .route("/sandboxes/metadata", get(handlers::list_sandbox_metadata))
        .route("/sandboxes/reconcile", post(handlers::trigger_reconcile))
        .route(
            "/sandboxes/reconcile/runs",
            get(handlers::list_reconcile_runs),
        )
        .route(
            "/sandboxes/reconcile/runs/{id}",
            get(handlers::get_reconcile_run),
        )
        .route(
            "/sandboxes/{id}",
            get(handlers::get_sandbox).delete(handlers::delete_sandbox),
        )
        .route(
            "/sandboxes/{id}/status-history",
            get(handlers::status_history),
        );

    let internal_routes = Router::new()
        .route(
            "/sandboxes/{id}/access-digest",
            get(handlers::access_digest),
        )
        .route("/sandboxes/{id}/address", get(handlers::runtime_address));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes)
        .nest("/internal/v1", internal_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve HTTP on `bind_addr` until `shutdown` flips to `true`.
///
/// In-flight requests are allowed to finish.
pub async fn run_http_server(
    bind_addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;

    info!(addr = %listener.local_addr()?, "Control plane HTTP server starting");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!("Control plane HTTP server stopped");
    Ok(())
}
