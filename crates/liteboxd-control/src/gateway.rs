// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lookups served to the access gateway.
//!
//! The gateway authenticates inbound requests by hashing the presented
//! credential and comparing digests, so the plaintext token never leaves the
//! control plane. Proxying needs the workload address, which is filled in
//! lazily from the cluster when the record has none yet.

use serde::Serialize;
use tracing::debug;

use crate::db::SandboxRecord;
use crate::error::{Error, Result};
use crate::lifecycle::DesiredState;
use crate::sandboxes::SandboxManager;
use crate::token::digest_matches;

/// Port the sandbox runtime listens on inside the workload.
pub const DEFAULT_RUNTIME_PORT: u16 = 3000;

/// Where to proxy traffic for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeAddress {
    /// Workload IP.
    pub ip: String,
    /// Runtime port.
    pub port: u16,
}

impl std::fmt::Display for RuntimeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Read-side interface for the access gateway.
#[derive(Clone)]
pub struct AccessGateway {
    manager: SandboxManager,
    runtime_port: u16,
}

impl AccessGateway {
    /// Create a gateway view over a manager.
    pub fn new(manager: SandboxManager) -> Self {
        Self {
            manager,
            runtime_port: DEFAULT_RUNTIME_PORT,
        }
    }

    /// Override the runtime port.
    pub fn with_runtime_port(mut self, port: u16) -> Self {
        self.runtime_port = port;
        self
    }

    /// Access token digest for a reachable sandbox.
    pub async fn lookup_access_token_digest(&self, id: &str) -> Result<String> {
        self.manager
            .store()
            .get_access_token_digest(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))
    }

    /// Whether `presented` is the sandbox's access token.
    pub async fn verify_access_token(&self, id: &str, presented: &str) -> Result<bool> {
        let digest = self.lookup_access_token_digest(id).await?;
        Ok(digest_matches(presented, &digest))
    }

    /// Address of a reachable sandbox's runtime.
    pub async fn lookup_runtime_address(&self, id: &str) -> Result<RuntimeAddress> {
        let mut record = self.manager.get(id).await?;
        if !is_reachable(&record) {
            return Err(Error::NotFound(format!("sandbox {}", id)));
        }

        if record.pod_ip.is_empty() {
            debug!(sandbox_id = %id, "No workload address recorded, polling cluster");
            record = self.manager.refresh(id).await?;
        }

        if record.pod_ip.is_empty() || !is_reachable(&record) {
            return Err(Error::NotFound(format!("address of sandbox {}", id)));
        }

        Ok(RuntimeAddress {
            ip: record.pod_ip,
            port: self.runtime_port,
        })
    }
}

fn is_reachable(record: &SandboxRecord) -> bool {
    record.desired() == DesiredState::Active && !record.status().reflects_absence()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockCluster, running_workload};
    use crate::db::tests::{sample_record, test_store};
    use crate::token::{TokenCipher, hash_token};
    use chrono::Utc;
    use std::sync::Arc;

    async fn gateway() -> (AccessGateway, SandboxManager, Arc<MockCluster>) {
        let store = test_store().await;
        let cluster = Arc::new(MockCluster::new());
        let cipher = Arc::new(TokenCipher::new(&[7u8; 32], "v1").unwrap());
        let manager = SandboxManager::new(store, cluster.clone(), cipher);
        (AccessGateway::new(manager.clone()), manager, cluster)
    }

    #[tokio::test]
    async fn test_digest_lookup_and_verify() {
        let (gateway, manager, _) = gateway().await;
        let mut record = sample_record("s1", Utc::now(), 600);
        record.access_token_sha256 = hash_token("secret");
        manager.store().insert_sandbox(&record, None).await.unwrap();

        assert_eq!(
            gateway.lookup_access_token_digest("s1").await.unwrap(),
            hash_token("secret")
        );
        assert!(gateway.verify_access_token("s1", "secret").await.unwrap());
        assert!(!gateway.verify_access_token("s1", "guess").await.unwrap());
        assert!(
            gateway
                .lookup_access_token_digest("missing")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_digest_hidden_for_lost_and_deleted() {
        let (gateway, manager, _) = gateway().await;
        let now = Utc::now();
        manager
            .store()
            .insert_sandbox(&sample_record("lost", now, 600), None)
            .await
            .unwrap();
        manager
            .store()
            .insert_sandbox(&sample_record("gone", now, 600), None)
            .await
            .unwrap();
        manager.store().mark_lost("lost", "test", now).await.unwrap();
        manager.store().mark_deleted("gone", "test", now).await.unwrap();

        for id in ["lost", "gone"] {
            assert!(
                gateway
                    .lookup_access_token_digest(id)
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
        }
    }

    #[tokio::test]
    async fn test_address_from_record() {
        let (gateway, manager, _) = gateway().await;
        manager
            .store()
            .insert_sandbox(&sample_record("s1", Utc::now(), 600), None)
            .await
            .unwrap();

        let address = gateway.lookup_runtime_address("s1").await.unwrap();
        assert_eq!(address.ip, "10.0.0.9");
        assert_eq!(address.port, DEFAULT_RUNTIME_PORT);
        assert_eq!(address.to_string(), "10.0.0.9:3000");
    }

    #[tokio::test]
    async fn test_address_polls_cluster_when_unknown() {
        let (gateway, manager, cluster) = gateway().await;
        let mut record = sample_record("s1", Utc::now(), 600);
        record.pod_ip = String::new();
        record.lifecycle_status = "pending".to_string();
        manager.store().insert_sandbox(&record, None).await.unwrap();
        cluster.insert(running_workload("s1", "10.1.2.3")).await;

        let address = gateway
            .with_runtime_port(8000)
            .lookup_runtime_address("s1")
            .await
            .unwrap();
        assert_eq!(address.ip, "10.1.2.3");
        assert_eq!(address.port, 8000);
        assert_eq!(manager.get("s1").await.unwrap().lifecycle_status, "running");
    }

    #[tokio::test]
    async fn test_address_not_found_without_ip() {
        let (gateway, manager, _) = gateway().await;
        let mut record = sample_record("s1", Utc::now(), 600);
        record.pod_ip = String::new();
        manager.store().insert_sandbox(&record, None).await.unwrap();

        assert!(
            gateway
                .lookup_runtime_address("s1")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
