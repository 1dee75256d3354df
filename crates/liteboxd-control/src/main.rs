// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! liteboxd control plane server
//!
//! An HTTP server responsible for:
//! - Sandbox lifecycle (create, delete, TTL expiry)
//! - Reconciliation of the store against the cluster
//! - Status history and reconcile audit
//! - Access token and address lookups for the gateway

use std::sync::Arc;
use tracing::{info, warn};

use liteboxd_control::cluster::{ClusterRuntime, KubeCluster};
use liteboxd_control::config::Config;
use liteboxd_control::db::SandboxStore;
use liteboxd_control::runtime::ControlPlaneRuntime;
use liteboxd_control::token::TokenCipher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liteboxd_control=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        namespace = %config.namespace,
        kube_api_url = %config.kube_api_url,
        data_dir = %config.data_dir.display(),
        "Starting liteboxd control plane"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    let store = SandboxStore::connect(&config.database_url, 5).await?;
    info!("Connected to database, migrations applied");

    let cipher = Arc::new(TokenCipher::from_key_material(
        &config.token_key,
        config.token_key_id.clone(),
    )?);

    let cluster = Arc::new(KubeCluster::from_config(&config)?);
    if let Err(e) = cluster.health_check().await {
        warn!(error = %e, "Cluster API not reachable yet");
    }
    info!(runtime_type = cluster.runtime_type(), "Cluster runtime initialized");

    let runtime = ControlPlaneRuntime::builder()
        .store(store)
        .cluster(cluster)
        .cipher(cipher)
        .bind_addr(config.http_addr)
        .gateway_url(&config.gateway_url)
        .namespace(&config.namespace)
        .request_timeout(config.request_timeout)
        .build()?
        .start()
        .await?;

    info!(addr = %config.http_addr, "Control plane ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("liteboxd control plane shut down");

    Ok(())
}
