// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers for the control plane.
//!
//! Handlers are thin: they parse the request, call into the manager,
//! reconciler or gateway, and map the result to a status code and JSON
//! body. Errors are rendered as `{ "code": ..., "message": ... }` with the
//! message sanitized by [`Error::public_message`].

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::db::{
    ListSandboxesOptions, ReconcileRunRecord, SandboxMetadataQuery, SandboxRecord,
    StatusHistoryRecord,
};
use crate::error::Error;
use crate::gateway::{AccessGateway, RuntimeAddress};
use crate::reconciler::{ReconcileReport, Reconciler, TriggerType};
use crate::sandboxes::{CreateSandboxRequest, SandboxManager};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle operations.
    pub manager: SandboxManager,
    /// Drift detection, shared with the reconcile worker.
    pub reconciler: Arc<Reconciler>,
    /// Lookups for the access gateway.
    pub gateway: AccessGateway,
    /// When the server started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl AppState {
    /// Create handler state.
    pub fn new(manager: SandboxManager, reconciler: Arc<Reconciler>) -> Self {
        Self {
            gateway: AccessGateway::new(manager.clone()),
            manager,
            reconciler,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Replace the gateway view, e.g. to change the runtime port.
    pub fn with_gateway(mut self, gateway: AccessGateway) -> Self {
        self.gateway = gateway;
        self
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code
    pub code: String,
    /// Sanitized message
    pub message: String,
}

impl ApiError {
    /// HTTP status for the wrapped error.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            Error::Cluster(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.0, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %self.0, "Request rejected");
        }

        (
            status,
            Json(ErrorBody {
                code: self.0.error_code().to_string(),
                message: self.0.public_message(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Views
// ============================================================================

/// Sandbox as returned by the API. Never carries token material.
#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxView {
    /// Sandbox id
    pub id: String,
    /// Template name
    pub template_name: String,
    /// Template version
    pub template_version: i64,
    /// Container image
    pub image: String,
    /// CPU limit
    pub cpu: String,
    /// Memory limit
    pub memory: String,
    /// Time to live in seconds
    pub ttl_seconds: i64,
    /// Container environment
    pub env: std::collections::BTreeMap<String, String>,
    /// Operator intent
    pub desired_state: String,
    /// Best-known condition
    pub lifecycle_status: String,
    /// Why the status last changed
    pub status_reason: String,
    /// Namespace
    pub cluster_namespace: String,
    /// Workload name
    pub pod_name: String,
    /// Observed workload UID
    pub pod_uid: String,
    /// Observed phase
    pub pod_phase: String,
    /// Observed IP
    pub pod_ip: String,
    /// Last observation
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Gateway URL
    pub access_url: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
    /// Deletion time
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<SandboxRecord> for SandboxView {
    fn from(r: SandboxRecord) -> Self {
        Self {
            env: r.env(),
            id: r.id,
            template_name: r.template_name,
            template_version: r.template_version,
            image: r.image,
            cpu: r.cpu,
            memory: r.memory,
            ttl_seconds: r.ttl_seconds,
            desired_state: r.desired_state,
            lifecycle_status: r.lifecycle_status,
            status_reason: r.status_reason,
            cluster_namespace: r.cluster_namespace,
            pod_name: r.pod_name,
            pod_uid: r.pod_uid,
            pod_phase: r.pod_phase,
            pod_ip: r.pod_ip,
            last_seen_at: r.last_seen_at,
            access_url: r.access_url,
            created_at: r.created_at,
            expires_at: r.expires_at,
            updated_at: r.updated_at,
            deleted_at: r.deleted_at,
        }
    }
}

/// Response to a create: the sandbox plus its plaintext token.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    /// Created sandbox
    #[serde(flatten)]
    pub sandbox: SandboxView,
    /// Plaintext access token, returned only here
    pub access_token: String,
}

/// Wrapper for list responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    /// Items
    pub items: Vec<T>,
}

/// One page of the metadata listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetadataListResponse {
    /// Sandboxes on this page
    pub items: Vec<SandboxView>,
    /// Matches across all pages
    pub total: i64,
    /// Page number
    pub page: i64,
    /// Page size
    pub page_size: i64,
}

// ============================================================================
// Query parameters
// ============================================================================

/// `GET /api/v1/sandboxes/metadata` parameters. Timestamps are RFC 3339.
#[derive(Debug, Default, Deserialize)]
pub struct MetadataQuery {
    id: Option<String>,
    template: Option<String>,
    desired_state: Option<String>,
    lifecycle_status: Option<String>,
    created_from: Option<String>,
    created_to: Option<String>,
    deleted_from: Option<String>,
    deleted_to: Option<String>,
    page: Option<i64>,
    page_size: Option<i64>,
}

impl MetadataQuery {
    fn into_store_query(self) -> Result<SandboxMetadataQuery, Error> {
        Ok(SandboxMetadataQuery {
            id_prefix: non_empty(self.id),
            template: non_empty(self.template),
            desired_state: non_empty(self.desired_state),
            lifecycle_status: non_empty(self.lifecycle_status),
            created_from: parse_time("created_from", self.created_from)?,
            created_to: parse_time("created_to", self.created_to)?,
            deleted_from: parse_time("deleted_from", self.deleted_from)?,
            deleted_to: parse_time("deleted_to", self.deleted_to)?,
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(0),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_time(name: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, Error> {
    match non_empty(value) {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(&v)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| Error::Validation(format!("invalid {}, expected RFC3339", name))),
    }
}

/// `GET /api/v1/sandboxes` parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ListSandboxesQuery {
    #[serde(default)]
    include_deleted: bool,
    limit: Option<i64>,
}

/// `GET /api/v1/sandboxes/{id}/status-history` parameters.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    limit: Option<i64>,
    before_id: Option<i64>,
}

/// `GET /api/v1/sandboxes/reconcile/runs` parameters.
#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    limit: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_healthy = state.manager.store().health_check().await.unwrap_or(false);
    let status = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "healthy": db_healthy,
            "version": state.version,
            "uptime_ms": state.uptime_ms(),
            "cluster": state.manager.cluster().runtime_type(),
        })),
    )
}

/// POST /api/v1/sandboxes
pub async fn create_sandbox(
    State(state): State<AppState>,
    Json(request): Json<CreateSandboxRequest>,
) -> ApiResult<(StatusCode, Json<CreateSandboxResponse>)> {
    let created = state.manager.create(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSandboxResponse {
            sandbox: created.record.into(),
            access_token: created.access_token,
        }),
    ))
}

/// GET /api/v1/sandboxes
pub async fn list_sandboxes(
    State(state): State<AppState>,
    Query(query): Query<ListSandboxesQuery>,
) -> ApiResult<Json<ListResponse<SandboxView>>> {
    let records = state
        .manager
        .list(&ListSandboxesOptions {
            include_deleted: query.include_deleted,
            limit: query.limit,
        })
        .await?;

    Ok(Json(ListResponse {
        items: records.into_iter().map(SandboxView::from).collect(),
    }))
}

/// GET /api/v1/sandboxes/metadata
pub async fn list_sandbox_metadata(
    State(state): State<AppState>,
    Query(query): Query<MetadataQuery>,
) -> ApiResult<Json<MetadataListResponse>> {
    let page = state
        .manager
        .list_metadata(&query.into_store_query()?)
        .await?;

    Ok(Json(MetadataListResponse {
        items: page.items.into_iter().map(SandboxView::from).collect(),
        total: page.total,
        page: page.page,
        page_size: page.page_size,
    }))
}

/// GET /api/v1/sandboxes/{id}
pub async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxView>> {
    Ok(Json(state.manager.get(&id).await?.into()))
}

/// DELETE /api/v1/sandboxes/{id}
pub async fn delete_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<SandboxView>)> {
    let record = state.manager.request_deletion(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(record.into())))
}

/// GET /api/v1/sandboxes/{id}/status-history
pub async fn status_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<ListResponse<StatusHistoryRecord>>> {
    let items = state
        .manager
        .status_history(&id, query.limit.unwrap_or(0), query.before_id)
        .await?;
    Ok(Json(ListResponse { items }))
}

/// POST /api/v1/sandboxes/reconcile
pub async fn trigger_reconcile(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<ReconcileReport>)> {
    let report = state.reconciler.run(TriggerType::Manual).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// GET /api/v1/sandboxes/reconcile/runs
pub async fn list_reconcile_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<ListResponse<ReconcileRunRecord>>> {
    let items = state.reconciler.list_runs(query.limit.unwrap_or(0)).await?;
    Ok(Json(ListResponse { items }))
}

/// GET /api/v1/sandboxes/reconcile/runs/{id}
pub async fn get_reconcile_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.reconciler.get_run(&id).await?))
}

/// GET /internal/v1/sandboxes/{id}/access-digest
pub async fn access_digest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let digest = state.gateway.lookup_access_token_digest(&id).await?;
    Ok(Json(json!({
        "sandbox_id": id,
        "access_token_sha256": digest,
    })))
}

/// GET /internal/v1/sandboxes/{id}/address
pub async fn runtime_address(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RuntimeAddress>> {
    Ok(Json(state.gateway.lookup_runtime_address(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterError;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(Error::Validation("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::NotFound("sandbox x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(Error::Cluster(ClusterError::Timeout)).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError(Error::Store(sqlx::Error::PoolClosed)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_metadata_query_parsing() {
        let query = MetadataQuery {
            id: Some(String::new()),
            template: Some("python".into()),
            created_from: Some("2025-03-01T10:00:00+02:00".into()),
            page_size: Some(5),
            ..Default::default()
        }
        .into_store_query()
        .unwrap();
        assert_eq!(query.id_prefix, None);
        assert_eq!(query.template.as_deref(), Some("python"));
        assert_eq!(
            query.created_from.map(|t| t.to_rfc3339()).as_deref(),
            Some("2025-03-01T08:00:00+00:00")
        );
        assert_eq!(query.page(), 1);
        assert_eq!(query.page_size(), 5);

        let err = MetadataQuery {
            deleted_to: Some("yesterday".into()),
            ..Default::default()
        }
        .into_store_query()
        .unwrap_err();
        assert_eq!(err.public_message(), "invalid deleted_to, expected RFC3339");
    }
}
