// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent store for sandbox records, status history and reconcile runs.
//!
//! Backed by SQLite through sqlx. Guarded writes are single statements keyed
//! by sandbox id, so the TTL sweep, the reconciler and API calls can touch the
//! same record concurrently without read-modify-write races. Multi-statement
//! changes (create, purge) run in one transaction.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::audit::StatusTransition;
use crate::cluster::Workload;
use crate::lifecycle::{DesiredState, LifecycleStatus};
use crate::token::SealedToken;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Default page size for status history.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
/// Maximum page size for status history.
pub const MAX_HISTORY_LIMIT: i64 = 200;
/// Default page size for reconcile runs.
pub const DEFAULT_RUNS_LIMIT: i64 = 20;
/// Maximum page size for reconcile runs.
pub const MAX_RUNS_LIMIT: i64 = 100;
/// Default page size for the metadata listing.
pub const DEFAULT_METADATA_PAGE_SIZE: i64 = 20;
/// Maximum page size for the metadata listing.
pub const MAX_METADATA_PAGE_SIZE: i64 = 100;

// ?1 id prefix, ?2 template, ?3 desired state, ?4 lifecycle status,
// ?5/?6 created range, ?7/?8 deleted range.
const METADATA_FILTER: &str = r#"
    WHERE (?1 IS NULL OR substr(id, 1, length(?1)) = ?1)
      AND (?2 IS NULL OR template_name = ?2)
      AND (?3 IS NULL OR desired_state = ?3)
      AND (?4 IS NULL OR lifecycle_status = ?4)
      AND (?5 IS NULL OR created_at >= ?5)
      AND (?6 IS NULL OR created_at <= ?6)
      AND (?7 IS NULL OR (deleted_at IS NOT NULL AND deleted_at >= ?7))
      AND (?8 IS NULL OR (deleted_at IS NOT NULL AND deleted_at <= ?8))
"#;

const SELECT_SANDBOX: &str = r#"
    SELECT id, template_name, template_version, image, cpu, memory, ttl_seconds, env_json,
           desired_state, lifecycle_status, status_reason, cluster_namespace,
           pod_name, pod_uid, pod_phase, pod_ip, last_seen_at,
           access_token_ciphertext, access_token_nonce, access_token_key_id,
           access_token_sha256, access_url,
           created_at, expires_at, updated_at, deleted_at
    FROM sandboxes
"#;

// ============================================================================
// Records
// ============================================================================

/// Control-plane record for one sandbox.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SandboxRecord {
    /// Opaque sandbox id.
    pub id: String,
    /// Template the sandbox was created from.
    pub template_name: String,
    /// Template version.
    pub template_version: i64,
    /// Container image.
    pub image: String,
    /// CPU limit.
    pub cpu: String,
    /// Memory limit.
    pub memory: String,
    /// Time to live in seconds.
    pub ttl_seconds: i64,
    /// Environment variables as a JSON object.
    pub env_json: String,
    /// Operator intent (`active`, `deleted`).
    pub desired_state: String,
    /// Best-known condition.
    pub lifecycle_status: String,
    /// Why the status last changed.
    pub status_reason: String,
    /// Namespace the workload lives in.
    pub cluster_namespace: String,
    /// Workload name.
    pub pod_name: String,
    /// Observed workload UID.
    pub pod_uid: String,
    /// Observed workload phase.
    pub pod_phase: String,
    /// Observed workload IP.
    pub pod_ip: String,
    /// When the workload was last observed.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Base64 AES-GCM ciphertext of the access token.
    pub access_token_ciphertext: String,
    /// Base64 nonce for the ciphertext.
    pub access_token_nonce: String,
    /// Key id used for the ciphertext.
    pub access_token_key_id: String,
    /// SHA-256 hex digest of the access token.
    pub access_token_sha256: String,
    /// URL the sandbox is reachable at through the gateway.
    pub access_url: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// `created_at + ttl_seconds`.
    pub expires_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Set exactly when `lifecycle_status = deleted`.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    /// Parsed lifecycle status (`unknown` for unrecognised values).
    pub fn status(&self) -> LifecycleStatus {
        self.lifecycle_status
            .parse()
            .unwrap_or(LifecycleStatus::Unknown)
    }

    /// Parsed desired state (`active` for unrecognised values).
    pub fn desired(&self) -> DesiredState {
        self.desired_state.parse().unwrap_or(DesiredState::Active)
    }

    /// Encrypted access token as persisted.
    pub fn sealed_token(&self) -> SealedToken {
        SealedToken {
            ciphertext: self.access_token_ciphertext.clone(),
            nonce: self.access_token_nonce.clone(),
            key_id: self.access_token_key_id.clone(),
        }
    }

    /// Environment map; malformed JSON yields an empty map.
    pub fn env(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.env_json).unwrap_or_default()
    }

    /// Whether the observed fields differ from a workload observation.
    pub fn observation_differs(&self, workload: &Workload) -> bool {
        self.pod_uid != workload.uid || self.pod_phase != workload.phase || self.pod_ip != workload.ip
    }
}

/// One row of a sandbox's status history.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct StatusHistoryRecord {
    /// Monotonic id, usable as a pagination cursor.
    pub id: i64,
    /// Sandbox id.
    pub sandbox_id: String,
    /// Origin (`api`, `watcher`, `reconcile`).
    pub source: String,
    /// Status before.
    pub from_status: String,
    /// Status after.
    pub to_status: String,
    /// Reason text.
    pub reason: String,
    /// JSON payload.
    pub payload_json: String,
    /// When the change happened.
    pub created_at: DateTime<Utc>,
}

/// One execution of the reconcile loop.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ReconcileRunRecord {
    /// Run id (`rec-xxxxxxxx`).
    pub id: String,
    /// `scheduled` or `manual`.
    pub trigger_type: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time, unset while running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Records in the store snapshot.
    pub total_db: i64,
    /// Workloads in the cluster snapshot.
    pub total_k8s: i64,
    /// Drift findings.
    pub drift_count: i64,
    /// Corrective writes that succeeded.
    pub fixed_count: i64,
    /// `running`, `completed` or `failed`.
    pub status: String,
    /// Failure text, empty on success.
    pub error: String,
}

/// One drift finding within a run.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ReconcileItemRecord {
    /// Item id.
    pub id: i64,
    /// Owning run.
    pub run_id: String,
    /// Sandbox id the finding is about.
    pub sandbox_id: String,
    /// `missing_in_k8s`, `missing_in_db` or `status_mismatch`.
    pub drift_type: String,
    /// `none`, `mark_deleted`, `mark_lost` or `alert_only`.
    pub action: String,
    /// Free text.
    pub detail: String,
    /// When the finding was recorded.
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts written when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    /// Records in the store snapshot.
    pub total_db: i64,
    /// Workloads in the cluster snapshot.
    pub total_k8s: i64,
    /// Drift findings.
    pub drift_count: i64,
    /// Corrective writes that succeeded.
    pub fixed_count: i64,
}

/// Rows removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    /// Reconcile items removed.
    pub reconcile_items: u64,
    /// Reconcile runs removed.
    pub reconcile_runs: u64,
    /// Status history rows removed.
    pub status_history: u64,
    /// Deleted sandbox records removed.
    pub sandboxes: u64,
}

impl PurgeStats {
    /// Total rows removed.
    pub fn total(&self) -> u64 {
        self.reconcile_items + self.reconcile_runs + self.status_history + self.sandboxes
    }
}

/// Options for listing sandboxes.
#[derive(Debug, Clone, Default)]
pub struct ListSandboxesOptions {
    /// Include logically deleted records.
    pub include_deleted: bool,
    /// Maximum rows, unlimited when unset.
    pub limit: Option<i64>,
}

/// Filters for the paginated metadata listing. Unset filters match everything.
#[derive(Debug, Clone, Default)]
pub struct SandboxMetadataQuery {
    /// Ids starting with this prefix
    pub id_prefix: Option<String>,
    /// Exact template name
    pub template: Option<String>,
    /// Exact desired state
    pub desired_state: Option<String>,
    /// Exact lifecycle status
    pub lifecycle_status: Option<String>,
    /// Created at or after
    pub created_from: Option<DateTime<Utc>>,
    /// Created at or before
    pub created_to: Option<DateTime<Utc>>,
    /// Deleted at or after (implies deleted)
    pub deleted_from: Option<DateTime<Utc>>,
    /// Deleted at or before (implies deleted)
    pub deleted_to: Option<DateTime<Utc>>,
    /// 1-based page number; values below 1 mean 1
    pub page: i64,
    /// Rows per page; `<= 0` means 20, capped at 100
    pub page_size: i64,
}

impl SandboxMetadataQuery {
    /// Effective page number.
    pub fn page(&self) -> i64 {
        self.page.max(1)
    }

    /// Effective page size.
    pub fn page_size(&self) -> i64 {
        clamp_limit(self.page_size, DEFAULT_METADATA_PAGE_SIZE, MAX_METADATA_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.page_size())
    }
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed control-plane store.
#[derive(Clone)]
pub struct SandboxStore {
    pool: SqlitePool,
}

impl SandboxStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, crate::error::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (creating if needed) a SQLite file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, crate::error::Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::Error::Other(format!(
                    "Failed to create directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        MIGRATOR.run(&self.pool).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection. Further queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check the database answers.
    pub async fn health_check(&self) -> Result<bool, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }

    // ========================================================================
    // Sandboxes
    // ========================================================================

    /// Insert a sandbox, replacing any stale row with the same id, together
    /// with its first history row.
    pub async fn insert_sandbox(
        &self,
        record: &SandboxRecord,
        initial: Option<&StatusTransition>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sandboxes WHERE id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, template_name, template_version, image, cpu, memory, ttl_seconds, env_json,
                desired_state, lifecycle_status, status_reason, cluster_namespace,
                pod_name, pod_uid, pod_phase, pod_ip, last_seen_at,
                access_token_ciphertext, access_token_nonce, access_token_key_id,
                access_token_sha256, access_url,
                created_at, expires_at, updated_at, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.template_name)
        .bind(record.template_version)
        .bind(&record.image)
        .bind(&record.cpu)
        .bind(&record.memory)
        .bind(record.ttl_seconds)
        .bind(&record.env_json)
        .bind(&record.desired_state)
        .bind(&record.lifecycle_status)
        .bind(&record.status_reason)
        .bind(&record.cluster_namespace)
        .bind(&record.pod_name)
        .bind(&record.pod_uid)
        .bind(&record.pod_phase)
        .bind(&record.pod_ip)
        .bind(record.last_seen_at)
        .bind(&record.access_token_ciphertext)
        .bind(&record.access_token_nonce)
        .bind(&record.access_token_key_id)
        .bind(&record.access_token_sha256)
        .bind(&record.access_url)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.updated_at)
        .bind(record.deleted_at)
        .execute(&mut *tx)
        .await?;

        if let Some(transition) = initial {
            insert_history(&mut *tx, transition).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch one sandbox.
    pub async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxRecord>, sqlx::Error> {
        sqlx::query_as::<_, SandboxRecord>(&format!("{} WHERE id = ?", SELECT_SANDBOX))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List sandboxes, newest first.
    pub async fn list_sandboxes(
        &self,
        options: &ListSandboxesOptions,
    ) -> Result<Vec<SandboxRecord>, sqlx::Error> {
        sqlx::query_as::<_, SandboxRecord>(&format!(
            "{} WHERE (?1 OR lifecycle_status <> 'deleted') ORDER BY created_at DESC LIMIT ?2",
            SELECT_SANDBOX
        ))
        .bind(options.include_deleted)
        .bind(options.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
    }

    /// Filtered page of sandboxes, newest first, with the total match count.
    pub async fn list_metadata(
        &self,
        query: &SandboxMetadataQuery,
    ) -> Result<(Vec<SandboxRecord>, i64), sqlx::Error> {
        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(1) FROM sandboxes {}", METADATA_FILTER))
                .bind(query.id_prefix.as_deref())
                .bind(query.template.as_deref())
                .bind(query.desired_state.as_deref())
                .bind(query.lifecycle_status.as_deref())
                .bind(query.created_from)
                .bind(query.created_to)
                .bind(query.deleted_from)
                .bind(query.deleted_to)
                .fetch_one(&self.pool)
                .await?;

        let items = sqlx::query_as::<_, SandboxRecord>(&format!(
            "{} {} ORDER BY created_at DESC LIMIT ?9 OFFSET ?10",
            SELECT_SANDBOX, METADATA_FILTER
        ))
        .bind(query.id_prefix.as_deref())
        .bind(query.template.as_deref())
        .bind(query.desired_state.as_deref())
        .bind(query.lifecycle_status.as_deref())
        .bind(query.created_from)
        .bind(query.created_to)
        .bind(query.deleted_from)
        .bind(query.deleted_to)
        .bind(query.page_size())
        .bind(query.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok((items, total))
    }

    /// Snapshot every record for a reconcile run, most recently updated first.
    pub async fn list_for_reconcile(&self) -> Result<Vec<SandboxRecord>, sqlx::Error> {
        sqlx::query_as::<_, SandboxRecord>(&format!(
            "{} ORDER BY updated_at DESC",
            SELECT_SANDBOX
        ))
        .fetch_all(&self.pool)
        .await
    }

    /// Active records whose TTL ran out by `now`, oldest expiry first.
    pub async fn list_expired_active(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SandboxRecord>, sqlx::Error> {
        sqlx::query_as::<_, SandboxRecord>(&format!(
            r#"{}
            WHERE desired_state = 'active'
              AND expires_at <= ?
              AND lifecycle_status NOT IN ('deleted', 'terminating')
            ORDER BY expires_at ASC"#,
            SELECT_SANDBOX
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Flip an active sandbox to `desired_state=deleted`, `lifecycle_status=terminating`.
    ///
    /// Returns `false` when the sandbox is missing or already being deleted.
    pub async fn set_desired_deleted(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET desired_state = 'deleted',
                lifecycle_status = 'terminating',
                status_reason = ?1,
                updated_at = ?2
            WHERE id = ?3 AND desired_state = 'active'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finalize logical deletion. `deleted_at` is set once and never moved.
    ///
    /// Returns `false` when the sandbox is missing or already deleted.
    pub async fn mark_deleted(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET desired_state = 'deleted',
                lifecycle_status = 'deleted',
                status_reason = ?1,
                deleted_at = COALESCE(deleted_at, ?2),
                updated_at = ?2
            WHERE id = ?3 AND lifecycle_status <> 'deleted'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Escalate an active sandbox to `lost`.
    ///
    /// Returns `false` when the sandbox is missing or not active, and when its
    /// status is already `lost`, `terminating`, `deleted`, `succeeded` or `failed`.
    pub async fn mark_lost(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET lifecycle_status = 'lost',
                status_reason = ?1,
                updated_at = ?2
            WHERE id = ?3
              AND desired_state = 'active'
              AND lifecycle_status NOT IN ('lost', 'terminating', 'deleted', 'succeeded', 'failed')
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Overwrite observed fields and `last_seen_at` from a workload observation.
    ///
    /// When `status` is given it replaces `lifecycle_status` only while the
    /// sandbox is still desired active, so a concurrent deletion is never
    /// undone. Returns `None` when the sandbox does not exist, otherwise
    /// whether `status` was written.
    pub async fn update_observed_state(
        &self,
        id: &str,
        workload: &Workload,
        status: Option<LifecycleStatus>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            UPDATE sandboxes
            SET pod_uid = ?1,
                pod_phase = ?2,
                pod_ip = ?3,
                last_seen_at = ?4,
                updated_at = ?4,
                lifecycle_status = CASE
                    WHEN ?5 IS NOT NULL AND desired_state = 'active' THEN ?5
                    ELSE lifecycle_status
                END,
                status_reason = CASE
                    WHEN ?5 IS NOT NULL AND desired_state = 'active' THEN ?6
                    ELSE status_reason
                END
            WHERE id = ?7
            RETURNING (?5 IS NOT NULL AND desired_state = 'active') AS status_applied
            "#,
        )
        .bind(&workload.uid)
        .bind(&workload.phase)
        .bind(&workload.ip)
        .bind(now)
        .bind(status.map(|s| s.as_str()))
        .bind(reason)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Digest of the access token for a sandbox that may currently be reached.
    ///
    /// `None` when the sandbox is missing, not desired active, lost or deleted.
    pub async fn get_access_token_digest(&self, id: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT access_token_sha256
            FROM sandboxes
            WHERE id = ?
              AND desired_state = 'active'
              AND lifecycle_status NOT IN ('deleted', 'lost')
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(digest,)| digest))
    }

    // ========================================================================
    // Status history
    // ========================================================================

    /// Append one history row. Returns its id.
    pub async fn append_status_history(
        &self,
        transition: &StatusTransition,
    ) -> Result<i64, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        insert_history(&mut *conn, transition).await
    }

    /// Page through a sandbox's history, newest first.
    ///
    /// `limit <= 0` uses the default of 50; larger values are capped at 200.
    /// `before_id` returns only rows with a smaller id.
    pub async fn list_status_history(
        &self,
        sandbox_id: &str,
        limit: i64,
        before_id: Option<i64>,
    ) -> Result<Vec<StatusHistoryRecord>, sqlx::Error> {
        let limit = clamp_limit(limit, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT);

        sqlx::query_as::<_, StatusHistoryRecord>(
            r#"
            SELECT id, sandbox_id, source, from_status, to_status, reason, payload_json, created_at
            FROM sandbox_status_history
            WHERE sandbox_id = ?1 AND (?2 IS NULL OR id < ?2)
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )
        .bind(sandbox_id)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    // ========================================================================
    // Reconcile runs
    // ========================================================================

    /// Open a run in `running` state.
    pub async fn create_reconcile_run(
        &self,
        id: &str,
        trigger_type: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sandbox_reconcile_runs (id, trigger_type, started_at, status)
            VALUES (?, ?, ?, 'running')
            "#,
        )
        .bind(id)
        .bind(trigger_type)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close a run with its totals and final status.
    pub async fn finish_reconcile_run(
        &self,
        id: &str,
        totals: &RunTotals,
        status: &str,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sandbox_reconcile_runs
            SET finished_at = ?1,
                total_db = ?2,
                total_k8s = ?3,
                drift_count = ?4,
                fixed_count = ?5,
                status = ?6,
                error = ?7
            WHERE id = ?8
            "#,
        )
        .bind(finished_at)
        .bind(totals.total_db)
        .bind(totals.total_k8s)
        .bind(totals.drift_count)
        .bind(totals.fixed_count)
        .bind(status)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record one drift finding.
    pub async fn add_reconcile_item(
        &self,
        run_id: &str,
        sandbox_id: &str,
        drift_type: &str,
        action: &str,
        detail: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO sandbox_reconcile_items (run_id, sandbox_id, drift_type, action, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(sandbox_id)
        .bind(drift_type)
        .bind(action)
        .bind(detail)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest runs first. `limit <= 0` uses 20; larger values are capped at 100.
    pub async fn list_reconcile_runs(
        &self,
        limit: i64,
    ) -> Result<Vec<ReconcileRunRecord>, sqlx::Error> {
        let limit = clamp_limit(limit, DEFAULT_RUNS_LIMIT, MAX_RUNS_LIMIT);

        sqlx::query_as::<_, ReconcileRunRecord>(
            r#"
            SELECT id, trigger_type, started_at, finished_at, total_db, total_k8s,
                   drift_count, fixed_count, status, error
            FROM sandbox_reconcile_runs
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Fetch one run.
    pub async fn get_reconcile_run(
        &self,
        id: &str,
    ) -> Result<Option<ReconcileRunRecord>, sqlx::Error> {
        sqlx::query_as::<_, ReconcileRunRecord>(
            r#"
            SELECT id, trigger_type, started_at, finished_at, total_db, total_k8s,
                   drift_count, fixed_count, status, error
            FROM sandbox_reconcile_runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Items of a run in recording order.
    pub async fn list_reconcile_items(
        &self,
        run_id: &str,
    ) -> Result<Vec<ReconcileItemRecord>, sqlx::Error> {
        sqlx::query_as::<_, ReconcileItemRecord>(
            r#"
            SELECT id, run_id, sandbox_id, drift_type, action, detail, created_at
            FROM sandbox_reconcile_items
            WHERE run_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete audit data older than `cutoff` and deleted sandboxes whose
    /// `deleted_at` is older than `cutoff`, all in one transaction.
    ///
    /// Active and terminating sandboxes are never removed regardless of age.
    pub async fn purge_historical_data(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeStats, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let reconcile_items = sqlx::query("DELETE FROM sandbox_reconcile_items WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let reconcile_runs = sqlx::query("DELETE FROM sandbox_reconcile_runs WHERE started_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let status_history = sqlx::query("DELETE FROM sandbox_status_history WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let sandboxes = sqlx::query(
            r#"
            DELETE FROM sandboxes
            WHERE lifecycle_status = 'deleted'
              AND deleted_at IS NOT NULL
              AND deleted_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(PurgeStats {
            reconcile_items,
            reconcile_runs,
            status_history,
            sandboxes,
        })
    }
}

async fn insert_history(
    conn: &mut sqlx::SqliteConnection,
    transition: &StatusTransition,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO sandbox_status_history
            (sandbox_id, source, from_status, to_status, reason, payload_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&transition.sandbox_id)
    .bind(transition.source.as_str())
    .bind(&transition.from_status)
    .bind(&transition.to_status)
    .bind(&transition.reason)
    .bind(transition.payload_json())
    .bind(transition.at)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

fn clamp_limit(limit: i64, default: i64, max: i64) -> i64 {
    if limit <= 0 { default } else { limit.min(max) }
}
