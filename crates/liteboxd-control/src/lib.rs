// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! liteboxd control plane - Sandbox Lifecycle and Reconciliation
//!
//! This crate runs lightweight per-user sandbox containers on a Kubernetes
//! cluster. It persists one control-plane record per sandbox, drives the
//! record through its lifecycle, and keeps it convergent with what the
//! cluster actually runs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 API clients              Access gateway                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                  │ /api/v1                      │ /internal/v1
//!                  ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   liteboxd-control (This Crate)                          │
//! │                         Port 8080                                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Sandbox   │  │ Reconciler  │  │ TTL Sweeper │  │  Retention  │     │
//! │  │   Manager   │  │             │  │             │  │   Worker    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                 │ create/get/list/delete
//!           │                 ▼
//!           │       ┌───────────────────┐        ┌─────────────────────────┐
//!           │       │ Kubernetes API    │───────►│   Sandbox pods          │
//!           │       │ (pods)            │        │   (label sandbox-id)    │
//!           │       └───────────────────┘        └─────────────────────────┘
//!           ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                             SQLite                                     │
//! │        (sandboxes, status history, reconcile runs and items)          │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Sandbox Lifecycle
//!
//! ```text
//!                     ┌─────────┐
//!                     │ PENDING │
//!                     └────┬────┘
//!                          │ observed Running
//!                          ▼
//!                     ┌─────────┐   workload absent    ┌──────┐
//!          ┌──────────│ RUNNING │─────beyond grace────►│ LOST │
//!          │          └────┬────┘                      └──────┘
//!          │               │
//!   observed│     delete / │ TTL expired
//!   Succeeded│     (desired=deleted)
//!   / Failed │               ▼
//!          │        ┌─────────────┐  workload gone   ┌─────────┐
//!          ▼        │ TERMINATING │─────────────────►│ DELETED │
//!   ┌────────────┐  └─────────────┘                  └─────────┘
//!   │ SUCCEEDED/ │
//!   │  FAILED    │
//!   └────────────┘
//! ```
//!
//! `deleted_at` is set exactly when the status becomes `deleted`. Once the
//! desired state is `deleted` no observation moves the record back.
//!
//! # HTTP API
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Store health, version, uptime |
//! | `POST` | `/api/v1/sandboxes` | Create a sandbox |
//! | `GET` | `/api/v1/sandboxes` | List sandboxes |
//! | `GET` | `/api/v1/sandboxes/{id}` | Get a sandbox |
//! | `DELETE` | `/api/v1/sandboxes/{id}` | Request deletion |
//! | `GET` | `/api/v1/sandboxes/{id}/status-history` | Status history page |
//! | `POST` | `/api/v1/sandboxes/reconcile` | Run the reconciler now |
//! | `GET` | `/api/v1/sandboxes/reconcile/runs` | Recent reconcile runs |
//! | `GET` | `/api/v1/sandboxes/reconcile/runs/{id}` | One run with items |
//! | `GET` | `/internal/v1/sandboxes/{id}/access-digest` | Token digest |
//! | `GET` | `/internal/v1/sandboxes/{id}/address` | Runtime address |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SANDBOX_TOKEN_ENCRYPTION_KEY` | Yes | - | AES key (base64, hex or raw; 16/24/32 bytes) |
//! | `SANDBOX_TOKEN_ENCRYPTION_KEY_ID` | No | `v1` | Key id stored with each token |
//! | `LITEBOXD_DATABASE_URL` | No | `sqlite:<data_dir>/liteboxd.db` | SQLite URL |
//! | `LITEBOXD_DATA_DIR` | No | `.data` | Data directory |
//! | `LITEBOXD_HTTP_PORT` | No | `8080` | HTTP port |
//! | `LITEBOXD_GATEWAY_URL` | No | `http://localhost:8080` | Public gateway URL |
//! | `LITEBOXD_NAMESPACE` | No | `liteboxd` | Sandbox namespace |
//! | `LITEBOXD_KUBE_API_URL` | No | in-cluster | Kubernetes API URL |
//! | `LITEBOXD_KUBE_TOKEN_PATH` | No | service account | Bearer token file |
//! | `LITEBOXD_KUBE_INSECURE` | No | `false` | Skip TLS verification |
//! | `LITEBOXD_REQUEST_TIMEOUT_SECS` | No | `30` | Cluster call deadline |
//! | `LITEBOXD_TTL_SWEEP_INTERVAL_SECS` | No | `30` | TTL sweep interval |
//! | `LITEBOXD_RECONCILE_INTERVAL_SECS` | No | `60` | Reconcile interval |
//! | `LITEBOXD_RECONCILE_LOST_GRACE_SECS` | No | `600` | Grace before `lost` |
//! | `LITEBOXD_RETENTION_ENABLED` | No | `false` | Enable purging |
//! | `LITEBOXD_RETENTION_POLL_INTERVAL_SECS` | No | `3600` | Purge interval |
//! | `LITEBOXD_RETENTION_MAX_AGE_DAYS` | No | `30` | Retention window |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`db`]: SQLite persistence for records, history and reconcile audit
//! - [`error`]: Error types for control-plane operations
//! - [`cluster`]: Cluster runtime abstraction (Kubernetes and mock)
//! - [`sandboxes`]: Create, delete and observe sandboxes
//! - [`reconciler`]: Drift detection and correction
//! - [`gateway`]: Lookups served to the access gateway
//! - [`server`]: HTTP server implementation

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// SQLite persistence for the control plane.
pub mod db;

/// Error types for control-plane operations.
pub mod error;

/// Cluster runtime abstraction.
pub mod cluster;

/// Access token generation, digests and encryption at rest.
pub mod token;

/// Lifecycle states and transition rules.
pub mod lifecycle;

/// Append-only status history.
pub mod audit;

/// Sandbox lifecycle operations.
pub mod sandboxes;

/// Store/cluster reconciliation.
pub mod reconciler;

/// TTL expiry worker.
pub mod ttl_sweeper;

/// Retention purge worker.
pub mod retention;

/// Access gateway lookups.
pub mod gateway;

/// HTTP request handlers.
pub mod handlers;

/// HTTP server.
pub mod server;

/// Embeddable runtime for running the control plane within an existing tokio application.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
