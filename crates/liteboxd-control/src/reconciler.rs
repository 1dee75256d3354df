// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation between the control-plane store and the cluster.
//!
//! One run snapshots every persisted record and every observed workload,
//! matches them by the `sandbox-id` label, classifies drift and applies
//! bounded corrections:
//!
//! | Finding          | Condition                                   | Action         |
//! |------------------|---------------------------------------------|----------------|
//! | `missing_in_k8s` | record terminating or desired deleted       | `mark_deleted` |
//! | `missing_in_k8s` | absent for at least the grace period        | `mark_lost`    |
//! | `missing_in_k8s` | absent for less than the grace period       | `none`         |
//! | `status_mismatch`| observed fields or derived status differ    | `none` (fixed) |
//! | `missing_in_db`  | workload without a record                   | `alert_only`   |
//!
//! Records whose status already reflects absence (`deleted`, `lost`) are
//! converged and produce no finding, so an immediate second run over an
//! unchanged cluster reports zero drift. Unknown workloads are never deleted
//! or adopted.
//!
//! Runs are serialized: a scheduled tick skips while another run is in
//! progress, a manual trigger waits for it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, HistorySource, StatusTransition};
use crate::cluster::{ClusterError, ClusterRuntime, Workload};
use crate::config::env_u64;
use crate::db::{
    ReconcileItemRecord, ReconcileRunRecord, RunTotals, SandboxRecord, SandboxStore,
};
use crate::error::{Error, Result};
use crate::lifecycle::{DesiredState, LifecycleStatus, derive_status};

/// Default time a workload may be absent before its sandbox is marked lost.
pub const DEFAULT_LOST_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Periodic worker tick.
    Scheduled,
    /// Operator request.
    Manual,
}

impl TriggerType {
    /// Persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of divergence found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftType {
    /// Record present, workload absent.
    MissingInK8s,
    /// Workload present, record absent.
    MissingInDb,
    /// Both present, observed state differs.
    StatusMismatch,
}

impl DriftType {
    /// Persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftType::MissingInK8s => "missing_in_k8s",
            DriftType::MissingInDb => "missing_in_db",
            DriftType::StatusMismatch => "status_mismatch",
        }
    }
}

/// Correction applied for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing beyond the audit entry.
    None,
    /// Logical deletion finalized.
    MarkDeleted,
    /// Escalated to `lost`.
    MarkLost,
    /// Left for a human.
    AlertOnly,
}

impl ReconcileAction {
    /// Persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::None => "none",
            ReconcileAction::MarkDeleted => "mark_deleted",
            ReconcileAction::MarkLost => "mark_lost",
            ReconcileAction::AlertOnly => "alert_only",
        }
    }
}

/// A run and its findings.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Run record
    #[serde(flatten)]
    pub run: ReconcileRunRecord,
    /// Findings in recording order
    pub items: Vec<ReconcileItemRecord>,
}

/// Drift detection and correction.
pub struct Reconciler {
    store: SandboxStore,
    cluster: Arc<dyn ClusterRuntime>,
    audit: AuditLog,
    lost_grace_period: Duration,
    run_lock: Mutex<()>,
}

struct Finding {
    sandbox_id: String,
    drift: DriftType,
    action: ReconcileAction,
    detail: String,
}

impl Reconciler {
    /// Create a reconciler with the default grace period.
    pub fn new(store: SandboxStore, cluster: Arc<dyn ClusterRuntime>) -> Self {
        Self {
            audit: AuditLog::new(store.clone()),
            store,
            cluster,
            lost_grace_period: DEFAULT_LOST_GRACE_PERIOD,
            run_lock: Mutex::new(()),
        }
    }

    /// Set the grace period before an absent workload escalates to `lost`.
    pub fn with_lost_grace_period(mut self, grace: Duration) -> Self {
        self.lost_grace_period = grace;
        self
    }

    /// Grace period in effect.
    pub fn lost_grace_period(&self) -> Duration {
        self.lost_grace_period
    }

    /// Perform one run, waiting for any run already in progress.
    pub async fn run(&self, trigger: TriggerType) -> Result<ReconcileReport> {
        let _guard = self.run_lock.lock().await;
        self.execute(trigger, Utc::now()).await
    }

    /// Perform one run against an explicit clock.
    pub async fn run_at(&self, trigger: TriggerType, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let _guard = self.run_lock.lock().await;
        self.execute(trigger, now).await
    }

    /// Perform one run unless another is in progress.
    pub async fn try_run(&self, trigger: TriggerType) -> Option<Result<ReconcileReport>> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.execute(trigger, Utc::now()).await)
    }

    /// Newest runs first. `limit <= 0` means 20, capped at 100.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<ReconcileRunRecord>> {
        Ok(self.store.list_reconcile_runs(limit).await?)
    }

    /// One run with its items.
    pub async fn get_run(&self, run_id: &str) -> Result<ReconcileReport> {
        let run = self
            .store
            .get_reconcile_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("reconcile run {}", run_id)))?;
        let items = self.store.list_reconcile_items(run_id).await?;
        Ok(ReconcileReport { run, items })
    }

    async fn execute(&self, trigger: TriggerType, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let run_id = format!("rec-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        self.store
            .create_reconcile_run(&run_id, trigger.as_str(), now)
            .await?;

        debug!(run_id = %run_id, trigger = %trigger, "Reconcile run started");

        let records = match self.store.list_for_reconcile().await {
            Ok(records) => records,
            Err(e) => {
                return self
                    .fail_run(&run_id, RunTotals::default(), &format!("list records: {}", e))
                    .await;
            }
        };

        let workloads = match self.cluster.list_workloads().await {
            Ok(workloads) => workloads,
            Err(e) => {
                let totals = RunTotals {
                    total_db: records.len() as i64,
                    ..Default::default()
                };
                return self
                    .fail_run(&run_id, totals, &format!("list workloads: {}", e))
                    .await;
            }
        };

        let mut totals = RunTotals {
            total_db: records.len() as i64,
            total_k8s: workloads.len() as i64,
            ..Default::default()
        };

        let mut by_id: HashMap<String, Workload> = workloads
            .into_iter()
            .filter(|w| !w.sandbox_id.is_empty())
            .map(|w| (w.sandbox_id.clone(), w))
            .collect();

        let mut findings = Vec::new();

        for record in &records {
            let (finding, fixed) = match by_id.remove(&record.id) {
                None => self.reconcile_absent(record, now).await,
                Some(workload) => self.reconcile_present(record, &workload, now).await,
            };
            if let Some(finding) = finding {
                totals.drift_count += 1;
                if fixed {
                    totals.fixed_count += 1;
                }
                findings.push(finding);
            }
        }

        let mut unknown: Vec<String> = by_id.into_keys().collect();
        unknown.sort();
        for sandbox_id in unknown {
            warn!(run_id = %run_id, sandbox_id = %sandbox_id, "Workload has no control-plane record");
            totals.drift_count += 1;
            findings.push(Finding {
                sandbox_id,
                drift: DriftType::MissingInDb,
                action: ReconcileAction::AlertOnly,
                detail: "sandbox workload exists in cluster but is missing in store".to_string(),
            });
        }

        for finding in &findings {
            if let Err(e) = self
                .store
                .add_reconcile_item(
                    &run_id,
                    &finding.sandbox_id,
                    finding.drift.as_str(),
                    finding.action.as_str(),
                    &finding.detail,
                    Utc::now(),
                )
                .await
            {
                warn!(
                    run_id = %run_id,
                    sandbox_id = %finding.sandbox_id,
                    error = %e,
                    "Failed to record reconcile item"
                );
            }
        }

        self.store
            .finish_reconcile_run(&run_id, &totals, "completed", "", Utc::now())
            .await?;

        if totals.drift_count > 0 {
            info!(
                run_id = %run_id,
                trigger = %trigger,
                total_db = totals.total_db,
                total_k8s = totals.total_k8s,
                drift_count = totals.drift_count,
                fixed_count = totals.fixed_count,
                "Reconcile run completed with drift"
            );
        } else {
            debug!(
                run_id = %run_id,
                total_db = totals.total_db,
                total_k8s = totals.total_k8s,
                "Reconcile run completed, no drift"
            );
        }

        self.get_run(&run_id).await
    }

    async fn fail_run(
        &self,
        run_id: &str,
        totals: RunTotals,
        error_text: &str,
    ) -> Result<ReconcileReport> {
        error!(run_id = %run_id, error = %error_text, "Reconcile run failed");
        self.store
            .finish_reconcile_run(run_id, &totals, "failed", error_text, Utc::now())
            .await?;
        self.get_run(run_id).await
    }

    /// Record present, workload absent. Returns the finding and whether a
    /// correction was written.
    async fn reconcile_absent(
        &self,
        record: &SandboxRecord,
        now: DateTime<Utc>,
    ) -> (Option<Finding>, bool) {
        let status = record.status();
        if status.reflects_absence() {
            return (None, false);
        }

        let mut action = ReconcileAction::None;
        let mut detail = "sandbox exists in store but workload not found in cluster".to_string();

        if status == LifecycleStatus::Terminating || record.desired() == DesiredState::Deleted {
            match self
                .store
                .mark_deleted(&record.id, "reconcile: workload not found", now)
                .await
            {
                Ok(true) => {
                    action = ReconcileAction::MarkDeleted;
                    self.audit
                        .record(
                            StatusTransition::new(
                                &record.id,
                                HistorySource::Reconcile,
                                &record.lifecycle_status,
                                LifecycleStatus::Deleted,
                                now,
                            )
                            .reason("reconcile: workload not found"),
                        )
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(sandbox_id = %record.id, error = %e, "Failed to finalize deletion");
                }
            }
        } else if status.is_terminal() {
            detail = format!("{}; status {} is terminal, not escalating", detail, status);
        } else {
            // A record never observed running counts its absence from creation,
            // so a workload that never came up still ends as lost.
            let last_seen = record.last_seen_at.unwrap_or(record.created_at);
            let absent_for = now.signed_duration_since(last_seen);
            let grace = chrono::Duration::from_std(self.lost_grace_period)
                .unwrap_or(chrono::Duration::MAX);

            if absent_for >= grace {
                match self
                    .store
                    .mark_lost(&record.id, "reconcile: workload missing beyond grace period", now)
                    .await
                {
                    Ok(true) => {
                        action = ReconcileAction::MarkLost;
                        self.audit
                            .record(
                                StatusTransition::new(
                                    &record.id,
                                    HistorySource::Reconcile,
                                    &record.lifecycle_status,
                                    LifecycleStatus::Lost,
                                    now,
                                )
                                .reason("reconcile: workload missing beyond grace period"),
                            )
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(sandbox_id = %record.id, error = %e, "Failed to mark sandbox lost");
                    }
                }
            } else {
                detail = format!(
                    "{}; absent for {}s, within grace period",
                    detail,
                    absent_for.num_seconds().max(0)
                );
            }
        }

        let fixed = action != ReconcileAction::None;
        (
            Some(Finding {
                sandbox_id: record.id.clone(),
                drift: DriftType::MissingInK8s,
                action,
                detail,
            }),
            fixed,
        )
    }

    /// Record and workload both present.
    async fn reconcile_present(
        &self,
        record: &SandboxRecord,
        workload: &Workload,
        now: DateTime<Utc>,
    ) -> (Option<Finding>, bool) {
        if record.desired() == DesiredState::Deleted && !workload.terminating {
            match self.cluster.delete_workload(&record.id).await {
                Ok(()) | Err(ClusterError::NotFound(_)) => {
                    debug!(sandbox_id = %record.id, "Re-issued workload deletion");
                }
                Err(e) => {
                    warn!(sandbox_id = %record.id, error = %e, "Failed to re-issue workload deletion");
                }
            }
        }

        let derived = derive_status(record, workload);
        let status_changed = derived != record.status();
        if !status_changed && !record.observation_differs(workload) {
            return (None, false);
        }

        let detail = format!(
            "db_status={}, pod_phase={}",
            record.lifecycle_status, workload.phase
        );
        let change = status_changed.then_some(derived);

        let fixed = match self
            .store
            .update_observed_state(&record.id, workload, change, "reconcile: observed state", now)
            .await
        {
            Ok(Some(applied)) => {
                if let Some(to) = change
                    && applied
                {
                    self.audit
                        .record(
                            StatusTransition::new(
                                &record.id,
                                HistorySource::Reconcile,
                                &record.lifecycle_status,
                                to,
                                now,
                            )
                            .reason(detail.clone()),
                        )
                        .await;
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(sandbox_id = %record.id, error = %e, "Failed to update observed state");
                false
            }
        };

        (
            Some(Finding {
                sandbox_id: record.id.clone(),
                drift: DriftType::StatusMismatch,
                action: ReconcileAction::None,
                detail,
            }),
            fixed,
        )
    }
}

/// Configuration for the reconcile worker.
#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    /// How often to run.
    pub poll_interval: Duration,
    /// Grace period before an absent workload escalates to `lost`.
    pub lost_grace_period: Duration,
}

impl Default for ReconcileWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            lost_grace_period: DEFAULT_LOST_GRACE_PERIOD,
        }
    }
}

impl ReconcileWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LITEBOXD_RECONCILE_INTERVAL_SECS`: seconds between runs (default: 60)
    /// - `LITEBOXD_RECONCILE_LOST_GRACE_SECS`: seconds before `lost` (default: 600)
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_u64("LITEBOXD_RECONCILE_INTERVAL_SECS", 60)),
            lost_grace_period: Duration::from_secs(env_u64(
                "LITEBOXD_RECONCILE_LOST_GRACE_SECS",
                DEFAULT_LOST_GRACE_PERIOD.as_secs(),
            )),
        }
    }
}

/// Background worker that runs the reconciler on a fixed interval.
pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    /// Create a worker around a shared reconciler.
    pub fn new(reconciler: Arc<Reconciler>, poll_interval: Duration) -> Self {
        Self {
            reconciler,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown is signalled.
    ///
    /// A run in progress when shutdown arrives is finished first.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            lost_grace_secs = self.reconciler.lost_grace_period().as_secs(),
            "Reconcile worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.reconciler.try_run(TriggerType::Scheduled).await {
                        None => debug!("Reconcile run already in progress, skipping tick"),
                        Some(Ok(report)) if report.run.status == "failed" => {
                            warn!(run_id = %report.run.id, error = %report.run.error, "Scheduled reconcile run failed");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => error!(error = %e, "Scheduled reconcile run aborted"),
                    }
                }
            }
        }

        info!("Reconcile worker stopped");
    }
}
