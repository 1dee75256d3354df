// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for sandbox lifecycle: creation, expiry, deletion and the record
//! invariants that must hold after every operation.

mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::{TestContext, create_request};
use liteboxd_control::db::{ListSandboxesOptions, SandboxRecord};
use liteboxd_control::lifecycle::expire_if_due;
use liteboxd_control::reconciler::TriggerType;
use liteboxd_control::token::hash_token;
use liteboxd_control::ttl_sweeper::{TtlSweeper, TtlSweeperConfig};

fn assert_invariants(record: &SandboxRecord) {
    if record.desired_state == "deleted" {
        assert!(
            record.lifecycle_status == "terminating" || record.lifecycle_status == "deleted",
            "{} has desired_state=deleted but status {}",
            record.id,
            record.lifecycle_status
        );
    }
    assert_eq!(
        record.lifecycle_status == "deleted",
        record.deleted_at.is_some(),
        "{} status {} with deleted_at {:?}",
        record.id,
        record.lifecycle_status,
        record.deleted_at
    );
}

async fn assert_all_invariants(ctx: &TestContext) {
    let records = ctx
        .store
        .list_sandboxes(&ListSandboxesOptions {
            include_deleted: true,
            limit: None,
        })
        .await
        .unwrap();
    for record in &records {
        assert_invariants(record);
    }
}

#[tokio::test]
async fn test_expiry_boundary() {
    let ctx = TestContext::new().await;
    let id = ctx.create(3600).await;
    let record = ctx.record(&id).await;
    let t0 = record.created_at;

    assert_eq!(record.expires_at, t0 + ChronoDuration::seconds(3600));
    assert!(!expire_if_due(&record, t0 + ChronoDuration::seconds(3599)));
    assert!(expire_if_due(&record, t0 + ChronoDuration::seconds(3601)));
}

#[tokio::test]
async fn test_create_persists_record_and_history() {
    let ctx = TestContext::new().await;
    let created = ctx.manager.create(create_request(600)).await.unwrap();
    let record = ctx.record(&created.record.id).await;

    assert_eq!(record.desired_state, "active");
    assert_eq!(record.lifecycle_status, "pending");
    assert_eq!(record.template_version, 3);
    assert_eq!(record.pod_name, format!("sandbox-{}", record.id));
    assert_eq!(record.access_token_sha256, hash_token(&created.access_token));
    assert!(!record.access_token_ciphertext.contains(&created.access_token));
    assert_eq!(
        record.access_url,
        format!("http://gateway.test/api/v1/sandbox/{}", record.id)
    );
    assert_eq!(
        ctx.manager.access_token(&record.id).await.unwrap(),
        created.access_token
    );

    let history = ctx
        .manager
        .status_history(&record.id, 0, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, "api");
    assert_eq!(history[0].from_status, "");
    assert_eq!(history[0].to_status, "pending");
    assert_invariants(&record);
}

#[tokio::test]
async fn test_non_positive_ttl_uses_default() {
    let ctx = TestContext::new().await;
    let id = ctx.create(0).await;
    assert_eq!(ctx.record(&id).await.ttl_seconds, 3600);
}

#[tokio::test]
async fn test_sweep_expires_due_sandboxes() {
    let ctx = TestContext::new().await;
    let due = ctx.create(60).await;
    let fresh = ctx.create(3600).await;

    let sweeper = TtlSweeper::new(ctx.manager.clone(), TtlSweeperConfig::default());
    let expired = sweeper
        .sweep_once(Utc::now() + ChronoDuration::seconds(120))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let record = ctx.record(&due).await;
    assert_eq!(record.desired_state, "deleted");
    assert_eq!(record.lifecycle_status, "terminating");
    assert!(ctx.cluster.workload(&due).await.is_none());
    assert_eq!(ctx.record(&fresh).await.lifecycle_status, "pending");

    let history = ctx.store.list_status_history(&due, 0, None).await.unwrap();
    assert_eq!(history[0].source, "watcher");
    assert_eq!(history[0].reason, "ttl expired");
    assert_eq!(history[0].to_status, "terminating");

    // A second sweep finds nothing new.
    let expired = sweeper
        .sweep_once(Utc::now() + ChronoDuration::seconds(120))
        .await
        .unwrap();
    assert_eq!(expired, 0);
    assert_all_invariants(&ctx).await;
}

#[tokio::test]
async fn test_expired_sandbox_is_finalized_by_reconcile() {
    let ctx = TestContext::new().await;
    let id = ctx.create(60).await;
    TtlSweeper::new(ctx.manager.clone(), TtlSweeperConfig::default())
        .sweep_once(Utc::now() + ChronoDuration::seconds(61))
        .await
        .unwrap();

    ctx.reconciler.run(TriggerType::Scheduled).await.unwrap();

    let record = ctx.record(&id).await;
    assert_eq!(record.lifecycle_status, "deleted");
    assert!(record.deleted_at.is_some());
    assert_all_invariants(&ctx).await;
}

#[tokio::test]
async fn test_invariants_hold_across_operations() {
    let ctx = TestContext::with_grace(Duration::ZERO).await;

    let running = ctx.create_running("10.0.0.1").await;
    let deleted = ctx.create(3600).await;
    let stuck = ctx.create(3600).await;
    let vanished = ctx.create_running("10.0.0.2").await;
    assert_all_invariants(&ctx).await;

    ctx.manager.request_deletion(&deleted).await.unwrap();
    assert_all_invariants(&ctx).await;

    ctx.cluster.set_fail_delete(true);
    ctx.manager.request_deletion(&stuck).await.unwrap();
    ctx.cluster.set_fail_delete(false);
    assert_all_invariants(&ctx).await;

    ctx.cluster.vanish(&vanished).await;
    ctx.cluster.vanish(&stuck).await;
    ctx.reconciler.run(TriggerType::Scheduled).await.unwrap();
    assert_all_invariants(&ctx).await;

    ctx.manager.refresh(&running).await.unwrap();
    assert_all_invariants(&ctx).await;

    assert_eq!(ctx.record(&running).await.lifecycle_status, "running");
    assert_eq!(ctx.record(&deleted).await.lifecycle_status, "deleted");
    assert_eq!(ctx.record(&stuck).await.lifecycle_status, "deleted");
    assert_eq!(ctx.record(&vanished).await.lifecycle_status, "lost");
}

#[tokio::test]
async fn test_list_hides_deleted_by_default() {
    let ctx = TestContext::new().await;
    let kept = ctx.create(3600).await;
    let gone = ctx.create(3600).await;
    ctx.cluster.vanish(&gone).await;
    ctx.manager.request_deletion(&gone).await.unwrap();
    assert_eq!(ctx.record(&gone).await.lifecycle_status, "deleted");

    let visible = ctx
        .manager
        .list(&ListSandboxesOptions::default())
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, kept);

    let all = ctx
        .manager
        .list(&ListSandboxesOptions {
            include_deleted: true,
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_status_history_pagination() {
    let ctx = TestContext::new().await;
    let id = ctx.create(3600).await;
    for (phase, ip) in [("Running", "10.0.0.1"), ("Succeeded", "10.0.0.1"), ("Failed", "")] {
        ctx.cluster.set_phase(&id, phase, ip).await;
        ctx.manager.refresh(&id).await.unwrap();
    }

    let all = ctx.manager.status_history(&id, 0, None).await.unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.windows(2).all(|w| w[0].id > w[1].id));
    assert_eq!(all[0].to_status, "failed");

    let page = ctx.manager.status_history(&id, 2, None).await.unwrap();
    assert_eq!(page.len(), 2);
    let next = ctx
        .manager
        .status_history(&id, 2, Some(page[1].id))
        .await
        .unwrap();
    assert_eq!(next.len(), 2);
    assert!(next[0].id < page[1].id);
    assert_eq!(next[1].to_status, "pending");

    assert!(
        ctx.manager
            .status_history("missing", 0, None)
            .await
            .unwrap_err()
            .is_not_found()
    );
}
