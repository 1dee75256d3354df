// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only status history.
//!
//! Every lifecycle transition, whether made by an API call, a background
//! watcher or the reconciler, is written here. Nothing in the control plane
//! reads it back for decisions; it exists for operators.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db::SandboxStore;
use crate::lifecycle::LifecycleStatus;

/// Who made a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySource {
    /// A client-facing API call.
    Api,
    /// A background observer (TTL sweep, runtime polling).
    Watcher,
    /// The reconciliation loop.
    Reconcile,
}

impl HistorySource {
    /// Persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistorySource::Api => "api",
            HistorySource::Watcher => "watcher",
            HistorySource::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for HistorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One history row waiting to be written.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    /// Sandbox the change applies to
    pub sandbox_id: String,
    /// Origin of the change
    pub source: HistorySource,
    /// Status before the change (empty for creation)
    pub from_status: String,
    /// Status after the change
    pub to_status: String,
    /// Human-readable reason
    pub reason: String,
    /// Extra structured context
    pub payload: Option<Value>,
    /// When the change happened
    pub at: DateTime<Utc>,
}

impl StatusTransition {
    /// Start a transition record.
    pub fn new(
        sandbox_id: impl Into<String>,
        source: HistorySource,
        from: impl Into<String>,
        to: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            source,
            from_status: from.into(),
            to_status: to.as_str().to_string(),
            reason: String::new(),
            payload: None,
            at,
        }
    }

    /// Attach a reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Attach a JSON payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Payload as stored (`{}` when absent).
    pub fn payload_json(&self) -> String {
        self.payload
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "{}".to_string())
    }
}

/// Writes status history rows without failing the caller.
#[derive(Clone)]
pub struct AuditLog {
    store: SandboxStore,
}

impl AuditLog {
    /// Create an audit log over a store.
    pub fn new(store: SandboxStore) -> Self {
        Self { store }
    }

    /// Append a transition. Failures are logged, not returned.
    pub async fn record(&self, transition: StatusTransition) {
        if let Err(e) = self.store.append_status_history(&transition).await {
            warn!(
                sandbox_id = %transition.sandbox_id,
                source = %transition.source,
                to_status = %transition.to_status,
                error = %e,
                "Failed to append status history"
            );
        }
    }
}
