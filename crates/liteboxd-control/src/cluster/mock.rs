// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cluster runtime for testing.
//!
//! Keeps workloads in memory and lets tests move them between phases, make
//! them vanish, plant foreign workloads and inject failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::traits::*;

/// Mock cluster runtime for testing.
pub struct MockCluster {
    workloads: Arc<Mutex<BTreeMap<String, Workload>>>,
    /// Phase reported for freshly created workloads
    pub initial_phase: String,
    /// Delay before `create_workload` answers
    pub create_delay: Duration,
    fail_create: AtomicBool,
    fail_list: AtomicBool,
    fail_delete: AtomicBool,
    delete_calls: AtomicUsize,
    list_hold: std::sync::Mutex<Option<ListHold>>,
}

/// Holds the next `list_workloads` call in flight until released.
#[derive(Clone, Default)]
pub struct ListHold {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl ListHold {
    /// Wait until the held call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held call return.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Create an empty mock cluster.
    pub fn new() -> Self {
        Self {
            workloads: Arc::new(Mutex::new(BTreeMap::new())),
            initial_phase: "Pending".to_string(),
            create_delay: Duration::ZERO,
            fail_create: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            delete_calls: AtomicUsize::new(0),
            list_hold: std::sync::Mutex::new(None),
        }
    }

    /// Create a mock cluster that rejects every create.
    pub fn rejecting() -> Self {
        let cluster = Self::new();
        cluster.fail_create.store(true, Ordering::SeqCst);
        cluster
    }

    /// Make `create_workload` fail (or succeed again).
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `list_workloads` fail (or succeed again).
    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Make `delete_workload` fail with an unavailable error (or succeed again).
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Park the next `list_workloads` call until the returned hold is released.
    pub fn hold_next_list(&self) -> ListHold {
        let hold = ListHold::default();
        if let Ok(mut slot) = self.list_hold.lock() {
            *slot = Some(hold.clone());
        }
        hold
    }

    /// Number of `delete_workload` calls received.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Set a workload's observed phase and IP.
    pub async fn set_phase(&self, sandbox_id: &str, phase: &str, ip: &str) {
        let mut workloads = self.workloads.lock().await;
        if let Some(w) = workloads.get_mut(sandbox_id) {
            w.phase = phase.to_string();
            w.ip = ip.to_string();
        }
    }

    /// Drop a workload without going through `delete_workload`, as if it
    /// was evicted or removed by hand.
    pub async fn vanish(&self, sandbox_id: &str) -> Option<Workload> {
        self.workloads.lock().await.remove(sandbox_id)
    }

    /// Plant a workload directly, e.g. one that has no control-plane record.
    pub async fn insert(&self, workload: Workload) {
        self.workloads
            .lock()
            .await
            .insert(workload.sandbox_id.clone(), workload);
    }

    /// Snapshot of one workload.
    pub async fn workload(&self, sandbox_id: &str) -> Option<Workload> {
        self.workloads.lock().await.get(sandbox_id).cloned()
    }

    /// Number of workloads currently present.
    pub async fn len(&self) -> usize {
        self.workloads.lock().await.len()
    }

    /// Whether no workloads are present.
    pub async fn is_empty(&self) -> bool {
        self.workloads.lock().await.is_empty()
    }
}

/// Build a running workload for tests.
pub fn running_workload(sandbox_id: &str, ip: &str) -> Workload {
    Workload {
        sandbox_id: sandbox_id.to_string(),
        name: workload_name(sandbox_id),
        uid: format!("uid-{}", sandbox_id),
        phase: "Running".to_string(),
        ip: ip.to_string(),
        terminating: false,
    }
}

#[async_trait]
impl ClusterRuntime for MockCluster {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<Workload> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ClusterError::Rejected(format!(
                "mock rejected image {}",
                spec.image
            )));
        }

        let mut workloads = self.workloads.lock().await;
        if workloads.contains_key(&spec.sandbox_id) {
            return Err(ClusterError::Rejected(format!(
                "workload for {} already exists",
                spec.sandbox_id
            )));
        }

        let workload = Workload {
            sandbox_id: spec.sandbox_id.clone(),
            name: workload_name(&spec.sandbox_id),
            uid: uuid::Uuid::new_v4().to_string(),
            phase: self.initial_phase.clone(),
            ip: String::new(),
            terminating: false,
        };
        workloads.insert(spec.sandbox_id.clone(), workload.clone());
        Ok(workload)
    }

    async fn get_workload(&self, sandbox_id: &str) -> Result<Workload> {
        self.workloads
            .lock()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(sandbox_id.to_string()))
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let hold = self.list_hold.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("mock list failure".to_string()));
        }
        Ok(self.workloads.lock().await.values().cloned().collect())
    }

    async fn delete_workload(&self, sandbox_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("mock delete failure".to_string()));
        }
        self.workloads
            .lock()
            .await
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(sandbox_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> WorkloadSpec {
        WorkloadSpec {
            sandbox_id: id.to_string(),
            image: "python:3.12-slim".to_string(),
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            ttl_seconds: 3600,
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let cluster = MockCluster::new();
        let created = cluster.create_workload(&spec("s1")).await.unwrap();
        assert_eq!(created.phase, "Pending");
        assert_eq!(created.name, "sandbox-s1");

        let fetched = cluster.get_workload("s1").await.unwrap();
        assert_eq!(fetched.uid, created.uid);

        cluster.delete_workload("s1").await.unwrap();
        assert!(matches!(
            cluster.delete_workload("s1").await,
            Err(ClusterError::NotFound(_))
        ));
        assert_eq!(cluster.delete_calls(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let cluster = MockCluster::new();
        cluster.create_workload(&spec("s1")).await.unwrap();
        assert!(matches!(
            cluster.create_workload(&spec("s1")).await,
            Err(ClusterError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let cluster = MockCluster::rejecting();
        assert!(cluster.create_workload(&spec("s1")).await.is_err());
        assert!(cluster.is_empty().await);

        cluster.set_fail_list(true);
        assert!(matches!(
            cluster.list_workloads().await,
            Err(ClusterError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_held_list_waits_for_release() {
        let cluster = Arc::new(MockCluster::new());
        cluster.create_workload(&spec("s1")).await.unwrap();
        let hold = cluster.hold_next_list();

        let lister = cluster.clone();
        let listing = tokio::spawn(async move { lister.list_workloads().await });
        hold.entered().await;
        assert!(!listing.is_finished());

        hold.release();
        assert_eq!(listing.await.unwrap().unwrap().len(), 1);
        assert_eq!(cluster.list_workloads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_phase_changes_and_vanish() {
        let cluster = MockCluster::new();
        cluster.create_workload(&spec("s1")).await.unwrap();
        cluster.set_phase("s1", "Running", "10.0.0.5").await;

        let w = cluster.get_workload("s1").await.unwrap();
        assert_eq!(w.phase, "Running");
        assert_eq!(w.ip, "10.0.0.5");

        assert!(cluster.vanish("s1").await.is_some());
        assert_eq!(cluster.len().await, 0);
    }
}
