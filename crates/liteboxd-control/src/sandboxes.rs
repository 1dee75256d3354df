// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-facing sandbox lifecycle operations.
//!
//! [`SandboxManager`] drives a single record through create, observation and
//! deletion. Cluster calls made on behalf of a client run under the
//! configured deadline; when it expires the call is abandoned and whatever
//! already committed in the store stays, to be converged by the reconciler.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, HistorySource, StatusTransition};
use crate::cluster::{self, ClusterError, ClusterRuntime, Workload, WorkloadSpec, workload_name};
use crate::db::{
    ListSandboxesOptions, SandboxMetadataQuery, SandboxRecord, SandboxStore, StatusHistoryRecord,
};
use crate::error::{Error, Result};
use crate::lifecycle::{DesiredState, LifecycleStatus, derive_status};
use crate::token::{TokenCipher, generate_token, hash_token};

/// TTL applied when a request leaves it unset or non-positive.
pub const DEFAULT_TTL_SECONDS: i64 = 3600;

/// Longest TTL a sandbox may request.
pub const MAX_TTL_SECONDS: i64 = i32::MAX as i64;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One page of the metadata listing.
#[derive(Debug, Clone)]
pub struct SandboxPage {
    /// Records on this page, newest first
    pub items: Vec<SandboxRecord>,
    /// Matches across all pages
    pub total: i64,
    /// Effective page number
    pub page: i64,
    /// Effective page size
    pub page_size: i64,
}

/// Resolved sandbox spec. Template resolution happens before this point.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSandboxRequest {
    /// Template name
    #[serde(default)]
    pub template_name: String,
    /// Template version
    #[serde(default)]
    pub template_version: i64,
    /// Container image (required)
    #[serde(default)]
    pub image: String,
    /// CPU limit
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory limit
    #[serde(default)]
    pub memory: Option<String>,
    /// Time to live in seconds
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    /// Container environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A newly created sandbox together with its plaintext access token.
///
/// This is the only time the plaintext leaves the control plane unasked.
#[derive(Debug, Clone)]
pub struct CreatedSandbox {
    /// Persisted record
    pub record: SandboxRecord,
    /// Plaintext access token
    pub access_token: String,
}

/// Lifecycle operations over the store and the cluster runtime.
#[derive(Clone)]
pub struct SandboxManager {
    store: SandboxStore,
    cluster: Arc<dyn ClusterRuntime>,
    cipher: Arc<TokenCipher>,
    audit: AuditLog,
    gateway_url: String,
    namespace: String,
    request_timeout: Duration,
}

impl SandboxManager {
    /// Create a manager with default gateway URL, namespace and deadline.
    pub fn new(
        store: SandboxStore,
        cluster: Arc<dyn ClusterRuntime>,
        cipher: Arc<TokenCipher>,
    ) -> Self {
        Self {
            audit: AuditLog::new(store.clone()),
            store,
            cluster,
            cipher,
            gateway_url: "http://localhost:8080".to_string(),
            namespace: "liteboxd".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the public gateway base URL used in access URLs.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the namespace recorded on new sandboxes.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the deadline for client-facing cluster calls.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &SandboxStore {
        &self.store
    }

    /// The cluster runtime.
    pub fn cluster(&self) -> &Arc<dyn ClusterRuntime> {
        &self.cluster
    }

    /// Access URL for a sandbox id.
    pub fn access_url(&self, id: &str) -> String {
        format!("{}/api/v1/sandbox/{}", self.gateway_url, id)
    }

    async fn with_deadline<T, F>(&self, fut: F) -> cluster::Result<T>
    where
        F: Future<Output = cluster::Result<T>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout),
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a sandbox: request the workload, then persist the record.
    ///
    /// Nothing is persisted if the cluster rejects the request. If persisting
    /// fails the workload is deleted again on a best-effort basis.
    pub async fn create(&self, request: CreateSandboxRequest) -> Result<CreatedSandbox> {
        let image = request.image.trim().to_string();
        if image.is_empty() {
            return Err(Error::Validation("image is required".to_string()));
        }
        if let Some(key) = request
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('='))
        {
            return Err(Error::Validation(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }

        let ttl_seconds = request
            .ttl_seconds
            .filter(|ttl| *ttl > 0)
            .unwrap_or(DEFAULT_TTL_SECONDS);
        if ttl_seconds > MAX_TTL_SECONDS {
            return Err(Error::Validation(format!(
                "ttl_seconds must not exceed {}",
                MAX_TTL_SECONDS
            )));
        }
        let cpu = non_empty_or(request.cpu, cluster::kube::DEFAULT_CPU_LIMIT);
        let memory = non_empty_or(request.memory, cluster::kube::DEFAULT_MEMORY_LIMIT);

        let id = uuid::Uuid::new_v4().simple().to_string();
        let access_token = generate_token();
        let sealed = self.cipher.seal(&access_token)?;

        let spec = WorkloadSpec {
            sandbox_id: id.clone(),
            image: image.clone(),
            cpu: cpu.clone(),
            memory: memory.clone(),
            ttl_seconds,
            env: request.env.clone(),
        };

        let workload = self
            .with_deadline(self.cluster.create_workload(&spec))
            .await
            .map_err(|e| {
                warn!(sandbox_id = %id, image = %image, error = %e, "Cluster rejected sandbox workload");
                e
            })?;

        let now = Utc::now();
        let status = LifecycleStatus::from_observed(&workload);
        let expires_at = now + chrono::Duration::seconds(ttl_seconds);

        let record = SandboxRecord {
            id: id.clone(),
            template_name: request.template_name,
            template_version: request.template_version,
            image,
            cpu,
            memory,
            ttl_seconds,
            env_json: serde_json::to_string(&request.env)?,
            desired_state: DesiredState::Active.as_str().to_string(),
            lifecycle_status: status.as_str().to_string(),
            status_reason: "sandbox created".to_string(),
            cluster_namespace: self.namespace.clone(),
            pod_name: if workload.name.is_empty() {
                workload_name(&id)
            } else {
                workload.name.clone()
            },
            pod_uid: workload.uid.clone(),
            pod_phase: workload.phase.clone(),
            pod_ip: workload.ip.clone(),
            last_seen_at: Some(now),
            access_token_ciphertext: sealed.ciphertext,
            access_token_nonce: sealed.nonce,
            access_token_key_id: sealed.key_id,
            access_token_sha256: hash_token(&access_token),
            access_url: self.access_url(&id),
            created_at: now,
            expires_at,
            updated_at: now,
            deleted_at: None,
        };

        let initial = StatusTransition::new(&id, HistorySource::Api, "", status, now)
            .reason("sandbox created")
            .payload(json!({
                "template": record.template_name,
                "template_version": record.template_version,
                "image": record.image,
                "pod_uid": record.pod_uid,
            }));

        if let Err(e) = self.store.insert_sandbox(&record, Some(&initial)).await {
            warn!(sandbox_id = %id, error = %e, "Failed to persist sandbox, removing workload");
            if let Err(cleanup) = self.cluster.delete_workload(&id).await {
                warn!(sandbox_id = %id, error = %cleanup, "Failed to remove orphaned workload");
            }
            return Err(e.into());
        }

        info!(
            sandbox_id = %id,
            image = %record.image,
            ttl_seconds = ttl_seconds,
            status = %status,
            "Sandbox created"
        );

        Ok(CreatedSandbox {
            record,
            access_token,
        })
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Request deletion on behalf of an API client.
    pub async fn request_deletion(&self, id: &str) -> Result<SandboxRecord> {
        self.request_deletion_from(id, HistorySource::Api, "deletion requested")
            .await
    }

    /// Request deletion, attributing the change to `source`.
    ///
    /// Sets `desired_state=deleted` and `lifecycle_status=terminating`, then
    /// asks the cluster to delete the workload. A second call is a no-op. If
    /// the workload is already gone the record is finalized as `deleted`;
    /// any other cluster failure is logged and left to the reconciler.
    pub async fn request_deletion_from(
        &self,
        id: &str,
        source: HistorySource,
        reason: &str,
    ) -> Result<SandboxRecord> {
        let record = self.get(id).await?;
        if record.desired() == DesiredState::Deleted {
            debug!(sandbox_id = %id, status = %record.lifecycle_status, "Deletion already requested");
            return Ok(record);
        }

        let now = Utc::now();
        if !self.store.set_desired_deleted(id, reason, now).await? {
            debug!(sandbox_id = %id, "Deletion raced with another writer");
            return self.get(id).await;
        }

        self.audit
            .record(
                StatusTransition::new(
                    id,
                    source,
                    &record.lifecycle_status,
                    LifecycleStatus::Terminating,
                    now,
                )
                .reason(reason),
            )
            .await;

        match self.with_deadline(self.cluster.delete_workload(id)).await {
            Ok(()) => {
                info!(sandbox_id = %id, source = %source, "Sandbox workload deletion issued");
            }
            Err(ClusterError::NotFound(_)) => {
                let now = Utc::now();
                if self
                    .store
                    .mark_deleted(id, "workload already absent", now)
                    .await?
                {
                    self.audit
                        .record(
                            StatusTransition::new(
                                id,
                                source,
                                LifecycleStatus::Terminating.as_str(),
                                LifecycleStatus::Deleted,
                                now,
                            )
                            .reason("workload already absent"),
                        )
                        .await;
                }
                info!(sandbox_id = %id, source = %source, "Sandbox deleted");
            }
            Err(e) => {
                warn!(
                    sandbox_id = %id,
                    error = %e,
                    "Workload deletion failed, leaving sandbox terminating for reconciliation"
                );
            }
        }

        self.get(id).await
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Record an observation of the sandbox's workload.
    ///
    /// Updates `pod_uid`, `pod_phase`, `pod_ip` and `last_seen_at`, and
    /// recomputes `lifecycle_status` for sandboxes still desired active.
    pub async fn observe_runtime_state(
        &self,
        id: &str,
        workload: &Workload,
        now: chrono::DateTime<Utc>,
        source: HistorySource,
    ) -> Result<SandboxRecord> {
        let record = self.get(id).await?;
        let derived = derive_status(&record, workload);
        let change = (derived != record.status()).then_some(derived);
        let reason = format!("observed phase {}", workload.phase);

        let Some(applied) = self
            .store
            .update_observed_state(id, workload, change, &reason, now)
            .await?
        else {
            return Err(Error::NotFound(format!("sandbox {}", id)));
        };

        if let Some(to) = change
            && applied
        {
            self.audit
                .record(
                    StatusTransition::new(id, source, &record.lifecycle_status, to, now)
                        .reason(reason)
                        .payload(json!({
                            "pod_uid": workload.uid,
                            "pod_phase": workload.phase,
                            "pod_ip": workload.ip,
                        })),
                )
                .await;
        }

        self.get(id).await
    }

    /// Poll the cluster once and record what it shows.
    ///
    /// An absent workload leaves the record untouched; absence is the
    /// reconciler's call.
    pub async fn refresh(&self, id: &str) -> Result<SandboxRecord> {
        match self.with_deadline(self.cluster.get_workload(id)).await {
            Ok(workload) => {
                self.observe_runtime_state(id, &workload, Utc::now(), HistorySource::Watcher)
                    .await
            }
            Err(ClusterError::NotFound(_)) => self.get(id).await,
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fetch a sandbox or fail with `NotFound`.
    pub async fn get(&self, id: &str) -> Result<SandboxRecord> {
        self.store
            .get_sandbox(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))
    }

    /// List sandboxes.
    pub async fn list(&self, options: &ListSandboxesOptions) -> Result<Vec<SandboxRecord>> {
        Ok(self.store.list_sandboxes(options).await?)
    }

    /// Filtered, paginated listing with a total count.
    pub async fn list_metadata(&self, query: &SandboxMetadataQuery) -> Result<SandboxPage> {
        if let Some(state) = query.desired_state.as_deref() {
            state.parse::<DesiredState>().map_err(Error::Validation)?;
        }
        if let Some(status) = query.lifecycle_status.as_deref() {
            status.parse::<LifecycleStatus>().map_err(Error::Validation)?;
        }

        let (items, total) = self.store.list_metadata(query).await?;
        Ok(SandboxPage {
            items,
            total,
            page: query.page(),
            page_size: query.page_size(),
        })
    }

    /// Decrypt a sandbox's access token for its owner.
    pub async fn access_token(&self, id: &str) -> Result<String> {
        let record = self.get(id).await?;
        Ok(self.cipher.open(&record.sealed_token())?)
    }

    /// Page through a sandbox's status history.
    pub async fn status_history(
        &self,
        id: &str,
        limit: i64,
        before_id: Option<i64>,
    ) -> Result<Vec<StatusHistoryRecord>> {
        self.get(id).await?;
        Ok(self.store.list_status_history(id, limit, before_id).await?)
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
