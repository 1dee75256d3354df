// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the liteboxd control plane.
//!
//! [`ControlPlaneRuntime`] owns every background task: the TTL sweeper, the
//! reconcile worker, the retention worker and the HTTP server. Shutdown is
//! cooperative; each task is signalled, allowed to finish its current cycle,
//! and awaited before the store is closed.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use liteboxd_control::cluster::KubeCluster;
//! use liteboxd_control::db::SandboxStore;
//! use liteboxd_control::runtime::ControlPlaneRuntime;
//! use liteboxd_control::token::TokenCipher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SandboxStore::connect("sqlite://liteboxd.db?mode=rwc", 5).await?;
//!     let cipher = Arc::new(TokenCipher::from_key_material("...", "v1")?);
//!     let cluster = Arc::new(KubeCluster::new(kube_config)?);
//!
//!     let runtime = ControlPlaneRuntime::builder()
//!         .store(store)
//!         .cluster(cluster)
//!         .cipher(cipher)
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cluster::ClusterRuntime;
use crate::db::SandboxStore;
use crate::gateway::{AccessGateway, DEFAULT_RUNTIME_PORT};
use crate::handlers::AppState;
use crate::reconciler::{ReconcileWorker, ReconcileWorkerConfig, Reconciler};
use crate::retention::{RetentionWorker, RetentionWorkerConfig};
use crate::sandboxes::SandboxManager;
use crate::server::run_http_server;
use crate::token::TokenCipher;
use crate::ttl_sweeper::{TtlSweeper, TtlSweeperConfig};

/// Builder for creating a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeBuilder {
    store: Option<SandboxStore>,
    cluster: Option<Arc<dyn ClusterRuntime>>,
    cipher: Option<Arc<TokenCipher>>,
    bind_addr: SocketAddr,
    gateway_url: String,
    namespace: String,
    request_timeout: Duration,
    runtime_port: u16,
    ttl_config: TtlSweeperConfig,
    reconcile_config: ReconcileWorkerConfig,
    retention_config: RetentionWorkerConfig,
}

impl Default for ControlPlaneRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            cluster: None,
            cipher: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            gateway_url: "http://localhost:8080".to_string(),
            namespace: "liteboxd".to_string(),
            request_timeout: Duration::from_secs(30),
            runtime_port: DEFAULT_RUNTIME_PORT,
            ttl_config: TtlSweeperConfig::from_env(),
            reconcile_config: ReconcileWorkerConfig::from_env(),
            retention_config: RetentionWorkerConfig::from_env(),
        }
    }
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn store(mut self, store: SandboxStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cluster runtime (required).
    pub fn cluster(mut self, cluster: Arc<dyn ClusterRuntime>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the access token cipher (required).
    pub fn cipher(mut self, cipher: Arc<TokenCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Set the bind address for the HTTP server.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the public gateway URL used to build access URLs.
    ///
    /// Default: `http://localhost:8080`
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    /// Set the namespace workloads are created in.
    ///
    /// Default: `liteboxd`
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the deadline for cluster calls made on behalf of a request.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the port the sandbox runtime listens on.
    ///
    /// Default: 3000
    pub fn runtime_port(mut self, port: u16) -> Self {
        self.runtime_port = port;
        self
    }

    /// Set the TTL sweeper configuration.
    ///
    /// Default: Loaded from environment variables via [`TtlSweeperConfig::from_env()`].
    pub fn ttl_config(mut self, config: TtlSweeperConfig) -> Self {
        self.ttl_config = config;
        self
    }

    /// Set the reconcile worker configuration.
    ///
    /// Default: Loaded from environment variables via [`ReconcileWorkerConfig::from_env()`].
    pub fn reconcile_config(mut self, config: ReconcileWorkerConfig) -> Self {
        self.reconcile_config = config;
        self
    }

    /// Set the retention worker configuration.
    ///
    /// Default: Loaded from environment variables via [`RetentionWorkerConfig::from_env()`].
    pub fn retention_config(mut self, config: RetentionWorkerConfig) -> Self {
        self.retention_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| anyhow::anyhow!("cluster is required"))?;
        let cipher = self
            .cipher
            .ok_or_else(|| anyhow::anyhow!("cipher is required"))?;

        Ok(ControlPlaneRuntimeConfig {
            store,
            cluster,
            cipher,
            bind_addr: self.bind_addr,
            gateway_url: self.gateway_url,
            namespace: self.namespace,
            request_timeout: self.request_timeout,
            runtime_port: self.runtime_port,
            ttl_config: self.ttl_config,
            reconcile_config: self.reconcile_config,
            retention_config: self.retention_config,
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    store: SandboxStore,
    cluster: Arc<dyn ClusterRuntime>,
    cipher: Arc<TokenCipher>,
    bind_addr: SocketAddr,
    gateway_url: String,
    namespace: String,
    request_timeout: Duration,
    runtime_port: u16,
    ttl_config: TtlSweeperConfig,
    reconcile_config: ReconcileWorkerConfig,
    retention_config: RetentionWorkerConfig,
}

impl ControlPlaneRuntimeConfig {
    /// Start the runtime, spawning the workers and the HTTP server.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let manager = SandboxManager::new(self.store.clone(), self.cluster.clone(), self.cipher)
            .with_gateway_url(self.gateway_url)
            .with_namespace(self.namespace)
            .with_request_timeout(self.request_timeout);

        let reconciler = Arc::new(
            Reconciler::new(self.store.clone(), self.cluster.clone())
                .with_lost_grace_period(self.reconcile_config.lost_grace_period),
        );

        let state = AppState::new(manager.clone(), reconciler.clone()).with_gateway(
            AccessGateway::new(manager.clone()).with_runtime_port(self.runtime_port),
        );

        // TTL sweeper
        let ttl_sweeper = TtlSweeper::new(manager.clone(), self.ttl_config);
        let ttl_shutdown = ttl_sweeper.shutdown_handle();
        let ttl_handle = tokio::spawn(async move {
            ttl_sweeper.run().await;
        });

        // Reconcile worker
        let reconcile_worker =
            ReconcileWorker::new(reconciler.clone(), self.reconcile_config.poll_interval);
        let reconcile_shutdown = reconcile_worker.shutdown_handle();
        let reconcile_handle = tokio::spawn(async move {
            reconcile_worker.run().await;
        });

        // Retention worker
        let retention_worker = RetentionWorker::new(self.store.clone(), self.retention_config);
        let retention_shutdown = retention_worker.shutdown_handle();
        let retention_handle = tokio::spawn(async move {
            retention_worker.run().await;
        });

        // HTTP server
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let bind_addr = self.bind_addr;
        let server_handle = tokio::spawn(run_http_server(
            bind_addr,
            state.clone(),
            server_shutdown_rx,
        ));

        info!(
            bind_addr = %bind_addr,
            cluster = self.cluster.runtime_type(),
            "ControlPlaneRuntime started"
        );

        Ok(ControlPlaneRuntime {
            server_handle,
            ttl_handle,
            reconcile_handle,
            retention_handle,
            server_shutdown_tx,
            ttl_shutdown,
            reconcile_shutdown,
            retention_shutdown,
            store: self.store,
            state,
            bind_addr,
        })
    }
}

/// A running control plane.
///
/// The runtime manages:
/// - HTTP server for the sandbox API and gateway lookups
/// - TTL sweeper for expiring sandboxes
/// - Reconcile worker for drift detection
/// - Retention worker for purging old audit data
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    server_handle: JoinHandle<Result<()>>,
    ttl_handle: JoinHandle<()>,
    reconcile_handle: JoinHandle<()>,
    retention_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    ttl_shutdown: Arc<Notify>,
    reconcile_shutdown: Arc<Notify>,
    retention_shutdown: Arc<Notify>,
    store: SandboxStore,
    state: AppState,
    bind_addr: SocketAddr,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// Get the bind address of the HTTP server.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the HTTP server and every worker to stop, waits for them to
    /// complete, then closes the store.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlaneRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.ttl_shutdown.notify_one();
        self.reconcile_shutdown.notify_one();
        self.retention_shutdown.notify_one();

        if let Err(e) = self.ttl_handle.await {
            error!("TTL sweeper task panicked: {}", e);
        }

        if let Err(e) = self.reconcile_handle.await {
            error!("Reconcile worker task panicked: {}", e);
        }

        if let Err(e) = self.retention_handle.await {
            error!("Retention worker task panicked: {}", e);
        }

        let server_result = match self.server_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("ControlPlaneRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("ControlPlaneRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        self.store.close().await;

        if server_result.is_ok() {
            info!("ControlPlaneRuntime shutdown complete");
        }
        server_result
    }

    /// Check if the runtime is still running.
    ///
    /// A disabled retention worker exits immediately and is not counted.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.ttl_handle.is_finished()
            && !self.reconcile_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::db::tests::test_store;

    #[test]
    fn test_build_requires_store() {
        let err = ControlPlaneRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("store is required"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = ControlPlaneRuntime::builder()
            .store(test_store().await)
            .cluster(Arc::new(MockCluster::new()))
            .cipher(Arc::new(TokenCipher::new(&[1u8; 32], "v1").unwrap()))
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .ttl_config(TtlSweeperConfig {
                poll_interval: Duration::from_secs(3600),
            })
            .reconcile_config(ReconcileWorkerConfig {
                poll_interval: Duration::from_secs(3600),
                ..Default::default()
            })
            .retention_config(RetentionWorkerConfig::default())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.is_running());

        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
    }
}
