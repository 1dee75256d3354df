// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for purging old audit data.
//!
//! Each cycle computes `cutoff = now - max_age` and, in a single
//! transaction, removes:
//! 1. reconcile items created before the cutoff
//! 2. reconcile runs started before the cutoff
//! 3. status history rows created before the cutoff
//! 4. deleted sandboxes whose `deleted_at` is before the cutoff
//!
//! Either every class is purged or none is. Sandboxes that are active or
//! terminating are never removed, however old.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::env_u64;
use crate::db::{PurgeStats, SandboxStore};
use crate::error::{Error, Result};

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// Whether retention is enabled.
    pub enabled: bool,
    /// How often to purge.
    pub poll_interval: Duration,
    /// Age past which audit data and deleted records are removed.
    pub max_age: Duration,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,                               // Disabled by default for safety
            poll_interval: Duration::from_secs(3600),     // 1 hour
            max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
        }
    }
}

impl RetentionWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LITEBOXD_RETENTION_ENABLED`: "true" or "1" to enable (default: false)
    /// - `LITEBOXD_RETENTION_POLL_INTERVAL_SECS`: seconds between purges (default: 3600)
    /// - `LITEBOXD_RETENTION_MAX_AGE_DAYS`: days of data to keep (default: 30)
    pub fn from_env() -> Self {
        let enabled = std::env::var("LITEBOXD_RETENTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            enabled,
            poll_interval: Duration::from_secs(env_u64(
                "LITEBOXD_RETENTION_POLL_INTERVAL_SECS",
                3600,
            )),
            max_age: max_age_from_days(env_u64("LITEBOXD_RETENTION_MAX_AGE_DAYS", 30)),
        }
    }
}

/// Convert a day count to a duration, falling back to 30 days on overflow.
fn max_age_from_days(days: u64) -> Duration {
    match days.checked_mul(24 * 3600) {
        Some(secs) => Duration::from_secs(secs),
        None => {
            warn!(days, "Retention max age out of range, using 30 days");
            Duration::from_secs(30 * 24 * 3600)
        }
    }
}

/// Background worker that purges historical data.
pub struct RetentionWorker {
    store: SandboxStore,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(store: SandboxStore, config: RetentionWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the retention loop.
    ///
    /// Returns immediately when disabled. Otherwise purges on every tick
    /// until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.purge_once(Utc::now()).await {
                        error!(error = %e, "Failed to purge historical data");
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// Purge everything older than `now - max_age`.
    pub async fn purge_once(&self, now: DateTime<Utc>) -> Result<PurgeStats> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| Error::Other(format!("Invalid retention max age: {}", e)))?;
        let cutoff = now.checked_sub_signed(max_age).ok_or_else(|| {
            Error::Other(format!(
                "Retention max age of {}s reaches past the earliest representable time",
                self.config.max_age.as_secs()
            ))
        })?;

        let stats = self.store.purge_historical_data(cutoff).await?;

        if stats.total() > 0 {
            info!(
                reconcile_items = stats.reconcile_items,
                reconcile_runs = stats.reconcile_runs,
                status_history = stats.status_history,
                sandboxes = stats.sandboxes,
                cutoff = %cutoff,
                "Retention cycle completed"
            );
        } else {
            debug!(cutoff = %cutoff, "Retention cycle completed, nothing to purge");
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RetentionWorkerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.max_age, Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn test_config_max_age_days() {
        let config = RetentionWorkerConfig {
            max_age: Duration::from_secs(7 * 24 * 3600),
            ..Default::default()
        };
        assert_eq!(config.max_age.as_secs() / 86400, 7);
    }

    #[test]
    fn test_max_age_from_days_overflow_falls_back() {
        assert_eq!(max_age_from_days(7), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(max_age_from_days(u64::MAX), Duration::from_secs(30 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_purge_with_out_of_range_max_age_errors() {
        let store = crate::db::tests::test_store().await;
        let worker = RetentionWorker::new(
            store,
            RetentionWorkerConfig {
                enabled: true,
                max_age: Duration::from_secs(1_000_000_000 * 24 * 3600),
                ..Default::default()
            },
        );

        let err = worker.purge_once(Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[tokio::test]
    async fn test_disabled_worker_returns_immediately() {
        let store = crate::db::tests::test_store().await;
        let worker = RetentionWorker::new(store, RetentionWorkerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("disabled worker should not loop");
    }
}
