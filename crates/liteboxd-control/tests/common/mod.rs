// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for liteboxd-control integration tests.
//!
//! Provides TestContext wiring an in-memory store, a mock cluster, the
//! sandbox manager and the reconciler together.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use liteboxd_control::cluster::{MockCluster, Workload, running_workload};
use liteboxd_control::db::{SandboxRecord, SandboxStore};
use liteboxd_control::reconciler::Reconciler;
use liteboxd_control::sandboxes::{CreateSandboxRequest, SandboxManager};
use liteboxd_control::token::TokenCipher;

/// Test context with every collaborator in memory.
pub struct TestContext {
    pub store: SandboxStore,
    pub cluster: Arc<MockCluster>,
    pub manager: SandboxManager,
    pub reconciler: Arc<Reconciler>,
}

impl TestContext {
    /// Create a context with the default ten-minute grace period.
    pub async fn new() -> Self {
        Self::with_grace(Duration::from_secs(600)).await
    }

    /// Create a context with a specific lost grace period.
    pub async fn with_grace(grace: Duration) -> Self {
        Self::with_cluster(MockCluster::new(), grace).await
    }

    /// Create a context around a preconfigured mock cluster.
    pub async fn with_cluster(cluster: MockCluster, grace: Duration) -> Self {
        let store = SandboxStore::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to create in-memory store");
        let cluster = Arc::new(cluster);
        let cipher = Arc::new(test_cipher());
        let manager = SandboxManager::new(store.clone(), cluster.clone(), cipher)
            .with_gateway_url("http://gateway.test");
        let reconciler = Arc::new(
            Reconciler::new(store.clone(), cluster.clone()).with_lost_grace_period(grace),
        );

        Self {
            store,
            cluster,
            manager,
            reconciler,
        }
    }

    /// Create a sandbox through the manager and return its id.
    pub async fn create(&self, ttl_seconds: i64) -> String {
        self.manager
            .create(create_request(ttl_seconds))
            .await
            .expect("Failed to create sandbox")
            .record
            .id
    }

    /// Create a sandbox and report its workload as running.
    pub async fn create_running(&self, ip: &str) -> String {
        let id = self.create(3600).await;
        self.cluster.set_phase(&id, "Running", ip).await;
        self.manager.refresh(&id).await.expect("Failed to refresh");
        id
    }

    /// Insert a record directly, bypassing the cluster.
    pub async fn insert(&self, record: &SandboxRecord) {
        self.store
            .insert_sandbox(record, None)
            .await
            .expect("Failed to insert record");
    }

    /// Fetch a record that must exist.
    pub async fn record(&self, id: &str) -> SandboxRecord {
        self.store
            .get_sandbox(id)
            .await
            .expect("Failed to read record")
            .expect("record should exist")
    }
}

/// Cipher with a fixed 256-bit key.
pub fn test_cipher() -> TokenCipher {
    TokenCipher::new(&[42u8; 32], "test").expect("valid key")
}

/// Minimal create request.
pub fn create_request(ttl_seconds: i64) -> CreateSandboxRequest {
    CreateSandboxRequest {
        template_name: "python".to_string(),
        template_version: 3,
        image: "python:3.12-slim".to_string(),
        ttl_seconds: Some(ttl_seconds),
        ..Default::default()
    }
}

/// A running record as if created at `created_at` and last seen then.
pub fn running_record(id: &str, created_at: DateTime<Utc>) -> SandboxRecord {
    let workload = running_workload(id, "10.0.0.5");
    SandboxRecord {
        id: id.to_string(),
        template_name: "python".to_string(),
        template_version: 1,
        image: "python:3.12-slim".to_string(),
        cpu: "500m".to_string(),
        memory: "512Mi".to_string(),
        ttl_seconds: 3600,
        env_json: "{}".to_string(),
        desired_state: "active".to_string(),
        lifecycle_status: "running".to_string(),
        status_reason: String::new(),
        cluster_namespace: "liteboxd".to_string(),
        pod_name: workload.name,
        pod_uid: workload.uid,
        pod_phase: workload.phase,
        pod_ip: workload.ip,
        last_seen_at: Some(created_at),
        access_token_ciphertext: String::new(),
        access_token_nonce: String::new(),
        access_token_key_id: "test".to_string(),
        access_token_sha256: format!("digest-{}", id),
        access_url: format!("http://gateway.test/api/v1/sandbox/{}", id),
        created_at,
        expires_at: created_at + chrono::Duration::seconds(3600),
        updated_at: created_at,
        deleted_at: None,
    }
}

/// A workload matching [`running_record`].
pub fn matching_workload(id: &str) -> Workload {
    running_workload(id, "10.0.0.5")
}
