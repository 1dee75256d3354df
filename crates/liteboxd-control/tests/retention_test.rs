// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the retention worker - purging old audit data and deleted
//! sandbox records.

mod common;

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{TestContext, running_record};
use liteboxd_control::audit::{HistorySource, StatusTransition};
use liteboxd_control::db::{PurgeStats, SandboxStore};
use liteboxd_control::lifecycle::LifecycleStatus;
use liteboxd_control::retention::{RetentionWorker, RetentionWorkerConfig};

fn worker(store: SandboxStore) -> RetentionWorker {
    RetentionWorker::new(
        store,
        RetentionWorkerConfig {
            enabled: true,
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
        },
    )
}

async fn history(store: &SandboxStore, id: &str, to: LifecycleStatus, at: DateTime<Utc>) {
    store
        .append_status_history(&StatusTransition::new(id, HistorySource::Api, "", to, at))
        .await
        .unwrap();
}

/// Seed a mix of sandboxes and audit rows either side of a 30 day cutoff.
async fn seed(ctx: &TestContext, now: DateTime<Utc>) {
    let old = now - ChronoDuration::days(90);
    let stale = now - ChronoDuration::days(60);
    let recent = now - ChronoDuration::days(1);

    ctx.insert(&running_record("active-old", old)).await;

    ctx.insert(&running_record("terminating-old", old)).await;
    ctx.store
        .set_desired_deleted("terminating-old", "test", stale)
        .await
        .unwrap();

    ctx.insert(&running_record("deleted-old", old)).await;
    ctx.store
        .mark_deleted("deleted-old", "test", stale)
        .await
        .unwrap();

    ctx.insert(&running_record("deleted-recent", old)).await;
    ctx.store
        .mark_deleted("deleted-recent", "test", recent)
        .await
        .unwrap();

    history(&ctx.store, "active-old", LifecycleStatus::Running, old).await;
    history(&ctx.store, "active-old", LifecycleStatus::Running, recent).await;
    history(&ctx.store, "deleted-old", LifecycleStatus::Deleted, stale).await;
    history(&ctx.store, "deleted-recent", LifecycleStatus::Deleted, recent).await;

    ctx.store
        .create_reconcile_run("rec-old", "scheduled", stale)
        .await
        .unwrap();
    ctx.store
        .add_reconcile_item("rec-old", "active-old", "status_mismatch", "none", "", stale)
        .await
        .unwrap();
    ctx.store
        .create_reconcile_run("rec-new", "scheduled", recent)
        .await
        .unwrap();
    ctx.store
        .add_reconcile_item("rec-new", "active-old", "status_mismatch", "none", "", recent)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_purge_removes_only_old_deleted_records() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    seed(&ctx, now).await;

    let stats = worker(ctx.store.clone()).purge_once(now).await.unwrap();

    assert_eq!(
        stats,
        PurgeStats {
            reconcile_items: 1,
            reconcile_runs: 1,
            status_history: 2,
            sandboxes: 1,
        }
    );

    assert!(ctx.store.get_sandbox("deleted-old").await.unwrap().is_none());
    for id in ["active-old", "terminating-old", "deleted-recent"] {
        assert!(
            ctx.store.get_sandbox(id).await.unwrap().is_some(),
            "{} should survive the purge",
            id
        );
    }

    let remaining = ctx
        .store
        .list_status_history("active-old", 0, None)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].created_at > now - ChronoDuration::days(30));

    assert!(ctx.store.get_reconcile_run("rec-old").await.unwrap().is_none());
    assert!(ctx.store.get_reconcile_run("rec-new").await.unwrap().is_some());
    assert_eq!(
        ctx.store.list_reconcile_items("rec-new").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_purge_is_idempotent() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    seed(&ctx, now).await;

    let worker = worker(ctx.store.clone());
    let first = worker.purge_once(now).await.unwrap();
    assert!(first.total() > 0);

    let second = worker.purge_once(now).await.unwrap();
    assert_eq!(second, PurgeStats::default());
    assert_eq!(second.total(), 0);
}

#[tokio::test]
async fn test_purge_never_removes_active_records() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    ctx.insert(&running_record("ancient", now - ChronoDuration::days(3650)))
        .await;

    let stats = worker(ctx.store.clone())
        .purge_once(now + ChronoDuration::days(3650))
        .await
        .unwrap();

    assert_eq!(stats.sandboxes, 0);
    assert!(ctx.store.get_sandbox("ancient").await.unwrap().is_some());
}

#[tokio::test]
async fn test_purge_is_all_or_nothing() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    seed(&ctx, now).await;

    // Break the third statement so the transaction fails part way.
    sqlx::query("DROP TABLE sandbox_status_history")
        .execute(ctx.store.pool())
        .await
        .unwrap();

    assert!(worker(ctx.store.clone()).purge_once(now).await.is_err());

    assert!(ctx.store.get_reconcile_run("rec-old").await.unwrap().is_some());
    assert_eq!(
        ctx.store.list_reconcile_items("rec-old").await.unwrap().len(),
        1
    );
    assert!(ctx.store.get_sandbox("deleted-old").await.unwrap().is_some());
}
