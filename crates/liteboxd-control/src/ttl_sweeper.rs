// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that tears down sandboxes whose TTL has run out.
//!
//! Each tick lists active records with `expires_at <= now` and requests
//! their deletion through the manager, so expiry goes through the same
//! `terminating` path as an API deletion. The history row is attributed to
//! the watcher with reason `ttl expired`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::audit::HistorySource;
use crate::config::env_u64;
use crate::error::Result;
use crate::lifecycle::expire_if_due;
use crate::sandboxes::SandboxManager;

/// Reason recorded when a sandbox expires.
pub const TTL_EXPIRED_REASON: &str = "ttl expired";

/// Configuration for the TTL sweeper.
#[derive(Debug, Clone)]
pub struct TtlSweeperConfig {
    /// How often to look for expired sandboxes.
    pub poll_interval: Duration,
}

impl Default for TtlSweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl TtlSweeperConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LITEBOXD_TTL_SWEEP_INTERVAL_SECS`: seconds between sweeps (default: 30)
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_u64("LITEBOXD_TTL_SWEEP_INTERVAL_SECS", 30)),
        }
    }
}

/// Background worker that expires sandboxes.
pub struct TtlSweeper {
    manager: SandboxManager,
    config: TtlSweeperConfig,
    shutdown: Arc<Notify>,
}

impl TtlSweeper {
    /// Create a new sweeper.
    pub fn new(manager: SandboxManager, config: TtlSweeperConfig) -> Self {
        Self {
            manager,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "TTL sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("TTL sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "TTL sweep failed");
                    }
                }
            }
        }

        info!("TTL sweeper stopped");
    }

    /// Expire every sandbox due at `now`. Returns how many were handed to
    /// deletion.
    ///
    /// A failure on one sandbox is logged and does not stop the sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.manager.store().list_expired_active(now).await?;
        let mut expired = 0;

        for record in due.iter().filter(|r| expire_if_due(r, now)) {
            match self
                .manager
                .request_deletion_from(&record.id, HistorySource::Watcher, TTL_EXPIRED_REASON)
                .await
            {
                Ok(updated) => {
                    expired += 1;
                    debug!(
                        sandbox_id = %record.id,
                        expires_at = %record.expires_at,
                        status = %updated.lifecycle_status,
                        "Sandbox expired"
                    );
                }
                Err(e) => {
                    warn!(sandbox_id = %record.id, error = %e, "Failed to expire sandbox");
                }
            }
        }

        if expired > 0 {
            info!(expired = expired, "TTL sweep completed");
        }

        Ok(expired)
    }
}
