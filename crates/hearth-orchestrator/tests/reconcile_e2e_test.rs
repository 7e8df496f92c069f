// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for orphan reconciliation: scheduler -> RECONCILE jobs -> worker.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use hearth_core::context::NodeClass;
use hearth_core::job::JobStatus;
use hearth_orchestrator::providers::RecordKind;
use hearth_orchestrator::reconcile::{
    ReconcileConfig, ReconcileEngine, ReconcileScheduler, ResourceType,
};

async fn provision(ctx: &TestContext, subscription_id: &str) {
    let outcome = ctx
        .service
        .request_create(subscription_id, spec(NodeClass::Cloud))
        .await
        .unwrap();
    let job = ctx.run_until_settled(outcome.job_id().unwrap()).await;
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_scheduled_sweep_deletes_only_orphans() {
    let ctx = TestContext::new(3).await;
    provision(&ctx, "sub-b").await;
    provision(&ctx, "sub-c").await;

    let old = Utc::now() - ChronoDuration::hours(2);
    let orphan = ctx.mocks.compute.insert_node("hearth-gone-g0", old).await;
    let foreign = ctx.mocks.compute.insert_node("build-runner", old).await;
    let young = ctx
        .mocks
        .compute
        .insert_node("hearth-booting-g0", Utc::now())
        .await;
    let stray_record = ctx
        .mocks
        .dns
        .insert_record(ZONE, "hearth-gone-g0", RecordKind::A, "192.0.2.9", old)
        .await;
    let mut expected_nodes = ctx.mocks.compute.node_ids().await;
    expected_nodes.retain(|id| *id != orphan.id);

    let scheduler = ReconcileScheduler::new(
        ctx.queue.clone(),
        ctx.store.clone(),
        ReconcileConfig::default(),
    );
    assert_eq!(
        scheduler.run_once().await.unwrap(),
        Some(ResourceType::ALL.len())
    );

    for _ in 0..3 {
        ctx.worker.poll_once().await.unwrap();
        ctx.worker.drain().await;
    }
    assert_eq!(
        ctx.queue.count_by_status(JobStatus::Completed).await.unwrap(),
        2 + ResourceType::ALL.len() as i64
    );

    let nodes = ctx.mocks.compute.node_ids().await;
    assert_eq!(nodes, expected_nodes);
    assert!(nodes.contains(&foreign.id));
    assert!(nodes.contains(&young.id));
    assert!(
        !ctx.mocks
            .dns
            .records()
            .await
            .iter()
            .any(|r| r.id == stray_record.id)
    );
    assert_eq!(ctx.mocks.dns.records().await.len(), 4);

    for sub in ["sub-b", "sub-c"] {
        assert!(ctx.context(sub).await.is_terminal());
    }
}

#[tokio::test]
async fn test_orphaned_records_are_swept_in_every_zone() {
    let ctx = TestContext::new(3).await;
    provision(&ctx, "sub-z").await;
    let live = ctx.context("sub-z").await.current().clone();

    let old = Utc::now() - ChronoDuration::hours(2);
    let dns = &ctx.mocks.dns;
    let here = dns
        .insert_record(ZONE, "hearth-gone-g0", RecordKind::A, "192.0.2.9", old)
        .await;
    let there = dns
        .insert_record("legacy.test", "hearth-moved-g3", RecordKind::A, "192.0.2.10", old)
        .await;
    let foreign = dns
        .insert_record("legacy.test", "mail", RecordKind::A, "192.0.2.11", old)
        .await;

    let engine = ReconcileEngine::standard(
        ctx.store.clone(),
        &ctx.mocks.as_providers(),
        ReconcileConfig::default(),
    );
    let report = engine.reconcile(ResourceType::DnsARecord).await.unwrap();

    assert_eq!(report.actual, 4);
    let mut orphans = report.orphans.clone();
    orphans.sort();
    let mut swept = vec![here.id.clone(), there.id.clone()];
    swept.sort();
    assert_eq!(orphans, swept);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.failed, 0);

    let left: Vec<String> = dns.records().await.into_iter().map(|r| r.id).collect();
    assert!(left.contains(&foreign.id));
    assert!(left.contains(live.a_record_id.as_ref().unwrap()));
    assert!(left.contains(live.c_name_id.as_ref().unwrap()));
    assert_eq!(left.len(), 3);
}

#[tokio::test]
async fn test_three_actual_two_expected() {
    let ctx = TestContext::new(3).await;
    provision(&ctx, "sub-b").await;
    provision(&ctx, "sub-c").await;
    let a = ctx
        .mocks
        .compute
        .insert_node("hearth-a-g0", Utc::now() - ChronoDuration::hours(1))
        .await;

    let engine = ReconcileEngine::standard(
        ctx.store.clone(),
        &ctx.mocks.as_providers(),
        ReconcileConfig::default(),
    );
    let report = engine.reconcile(ResourceType::ComputeNode).await.unwrap();

    assert_eq!(report.actual, 3);
    assert_eq!(report.expected, 2);
    assert_eq!(report.orphans, vec![a.id.clone()]);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(ctx.mocks.compute.node_ids().await.len(), 2);

    // Nothing left to do on the next sweep
    let again = engine.reconcile(ResourceType::ComputeNode).await.unwrap();
    assert!(again.orphans.is_empty());
}

#[tokio::test]
async fn test_resources_of_in_flight_migration_are_kept() {
    let ctx = TestContext::new(3).await;
    provision(&ctx, "sub-m").await;
    ctx.mocks
        .panel
        .fail_next(
            "create_server",
            hearth_orchestrator::providers::ProviderError::Unavailable {
                provider: "panel",
                message: "maintenance".to_string(),
            },
            10,
        )
        .await;
    let outcome = ctx
        .service
        .request_migration("sub-m", spec(NodeClass::Dedicated))
        .await
        .unwrap();
    let job = ctx.run_until_settled(outcome.job_id().unwrap()).await;
    assert_eq!(job.status, JobStatus::DeadLetter);

    // Both generations' nodes are recorded, so neither is an orphan
    let context = ctx.context("sub-m").await;
    assert!(context.new_resources().node_id.is_some());
    let engine = Arc::new(ReconcileEngine::standard(
        ctx.store.clone(),
        &ctx.mocks.as_providers(),
        ReconcileConfig {
            grace_period: std::time::Duration::ZERO,
            ..Default::default()
        },
    ));
    let report = engine.reconcile(ResourceType::ComputeNode).await.unwrap();
    assert_eq!(report.actual, 2);
    assert!(report.orphans.is_empty());
}
