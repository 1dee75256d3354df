// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster runtime trait definitions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label every sandbox workload carries.
pub const APP_LABEL: &str = "app";
/// Value of [`APP_LABEL`] for sandbox workloads.
pub const APP_LABEL_VALUE: &str = "liteboxd";
/// Label carrying the sandbox id.
pub const SANDBOX_ID_LABEL: &str = "sandbox-id";

/// Errors from cluster runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// No workload exists for the sandbox.
    #[error("Workload not found: {0}")]
    NotFound(String),

    /// The runtime refused the request (invalid spec, quota, conflict).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The runtime could not be reached.
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    /// The caller's deadline expired before the runtime answered.
    #[error("Cluster request timed out")]
    Timeout,

    /// The runtime answered with an unexpected status.
    #[error("Cluster API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The runtime's response could not be decoded.
    #[error("Failed to decode cluster response: {0}")]
    Decode(String),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// What to run for one sandbox.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Sandbox id, written to the `sandbox-id` label
    pub sandbox_id: String,
    /// Container image
    pub image: String,
    /// CPU limit (e.g. `500m`)
    pub cpu: String,
    /// Memory limit (e.g. `512Mi`)
    pub memory: String,
    /// Time to live, recorded as an annotation
    pub ttl_seconds: i64,
    /// Container environment
    pub env: BTreeMap<String, String>,
}

/// Observed state of one sandbox workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Sandbox id taken from the `sandbox-id` label
    pub sandbox_id: String,
    /// Workload (pod) name
    pub name: String,
    /// Stable per-workload identity
    pub uid: String,
    /// Observed phase as reported by the runtime (`Pending`, `Running`, ...)
    pub phase: String,
    /// Workload IP, empty until scheduled
    pub ip: String,
    /// Deletion has been requested and is in progress
    pub terminating: bool,
}

/// Pod name for a sandbox.
pub fn workload_name(sandbox_id: &str) -> String {
    format!("sandbox-{}", sandbox_id)
}

/// Cluster runtime abstraction.
///
/// Implementations must be idempotent by identity: creating an existing
/// workload is rejected, deleting a missing one reports `NotFound`.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Short name of this runtime, for logs.
    fn runtime_type(&self) -> &'static str;

    /// Create the workload for a sandbox and return its first observation.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<Workload>;

    /// Look up the workload carrying `sandbox-id=<sandbox_id>`.
    async fn get_workload(&self, sandbox_id: &str) -> Result<Workload>;

    /// List every sandbox workload (`app=liteboxd`).
    async fn list_workloads(&self) -> Result<Vec<Workload>>;

    /// Delete the workload for a sandbox.
    async fn delete_workload(&self, sandbox_id: &str) -> Result<()>;

    /// Check the runtime is reachable.
    async fn health_check(&self) -> Result<()> {
        self.list_workloads().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_name() {
        assert_eq!(workload_name("abc123"), "sandbox-abc123");
    }

    #[test]
    fn test_error_display() {
        let err = ClusterError::Api {
            status: 503,
            message: "overloaded".into(),
        };
        assert_eq!(err.to_string(), "Cluster API error 503: overloaded");
        assert_eq!(
            ClusterError::NotFound("s1".into()).to_string(),
            "Workload not found: s1"
        );
    }
}
