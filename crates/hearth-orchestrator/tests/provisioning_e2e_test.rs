// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for provisioning pipelines driven through the job worker.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use hearth_core::context::{
    ContextStatus, NodeClass, ProvisioningContext, ProvisioningMode, StepType,
};
use hearth_core::job::{JobStatus, JobType};
use hearth_core::ProvisioningState;
use hearth_orchestrator::error::ProvisioningError;
use hearth_orchestrator::executor::StepExecutor;
use hearth_orchestrator::jobs::JobWorkerConfig;
use hearth_orchestrator::naming;
use hearth_orchestrator::providers::mock::MockProviders;
use hearth_orchestrator::providers::{PowerState, ProviderError, RecordKind};
use hearth_orchestrator::service::ProvisioningService;
use hearth_orchestrator::steps::{Step, StepRegistry, StepTransition};

fn unavailable(provider: &'static str) -> ProviderError {
    ProviderError::Unavailable {
        provider,
        message: "503 Service Unavailable".to_string(),
    }
}

#[tokio::test]
async fn test_create_end_to_end() {
    let ctx = TestContext::new(5).await;

    let outcome = ctx
        .service
        .request_create("sub-create", spec(NodeClass::Cloud))
        .await
        .unwrap();
    let job = ctx.run_until_settled(outcome.job_id().unwrap()).await;
    assert_eq!(job.status, JobStatus::Completed);

    let context = ctx.context("sub-create").await;
    assert!(context.is_terminal());
    assert_eq!(context.step_type(), StepType::Ready);
    assert_eq!(context.state(), ProvisioningState::Ready);

    let ids = context.current().clone();
    assert_eq!(ctx.mocks.compute.node_ids().await, vec![ids.node_id.unwrap()]);
    assert_eq!(
        ctx.mocks.panel.server_ids().await,
        vec![ids.panel_server_id.clone().unwrap()]
    );
    assert_eq!(ctx.mocks.panel.allocation_count().await, 1);
    assert_eq!(
        ctx.mocks
            .panel
            .power_state(ids.panel_server_id.as_deref().unwrap())
            .await,
        Some(PowerState::Start)
    );

    let records = ctx.mocks.dns.records().await;
    assert_eq!(records.len(), 2);
    let cname = records
        .iter()
        .find(|r| r.kind == RecordKind::Cname)
        .unwrap();
    assert_eq!(
        cname.content,
        format!("{}.{}", naming::resource_name("sub-create", 0), ZONE)
    );
    assert_eq!(ctx.mocks.installer.configured().await.len(), 1);
}

/// Stands in for a process that dies while running a step: the step never
/// returns and the future is dropped.
struct Hang(StepType);

#[async_trait]
impl Step for Hang {
    fn step_type(&self) -> StepType {
        self.0
    }

    async fn execute(
        &self,
        _context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_crash_after_a_record_resumes_without_recreating() {
    let store = memory_store().await;
    let mocks = MockProviders::default();
    let ctx = TestContext::with_store(
        store.clone(),
        mocks.clone(),
        5,
        JobWorkerConfig {
            stale_after: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(5),
            ..Default::default()
        },
    );

    let outcome = ctx
        .service
        .request_create("sub-crash", spec(NodeClass::Cloud))
        .await
        .unwrap();
    let job_id = outcome.job_id().unwrap().to_string();

    // First process claims the job and dies inside PTERODACTYL_NODE.
    let claimed = store
        .claim_jobs(JobStatus::Pending, 1, Utc::now())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let mut registry = StepRegistry::standard(mocks.as_providers(), settings());
    registry.register(Arc::new(Hang(StepType::PterodactylNode)));
    let doomed = StepExecutor::new(Arc::new(registry), store.clone());
    let context = ctx.context("sub-crash").await;
    assert!(
        tokio::time::timeout(Duration::from_millis(50), doomed.execute(context))
            .await
            .is_err()
    );

    let persisted = ctx.context("sub-crash").await;
    assert_eq!(persisted.step_type(), StepType::PterodactylNode);
    assert!(persisted.current().a_record_id.is_some());

    // Second process: the stale claim is requeued and the pipeline resumes.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let job = ctx.run_until_settled(&job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    // The lost worker used up one attempt
    assert_eq!(job.retry_count, 1);
    assert!(ctx.context("sub-crash").await.is_terminal());
    assert_eq!(mocks.compute.call_count("create_node").await, 1);
    // One A record and one CNAME; the A record was not created again
    assert_eq!(mocks.dns.call_count("create_record").await, 2);
    assert_eq!(mocks.dns.records().await.len(), 2);
}

#[tokio::test]
async fn test_provider_failure_retries_then_completes() {
    let ctx = TestContext::new(5).await;
    ctx.mocks
        .panel
        .fail_next("create_server", unavailable("panel"), 2)
        .await;

    let outcome = ctx
        .service
        .request_create("sub-flaky", spec(NodeClass::Dedicated))
        .await
        .unwrap();
    let job = ctx.run_until_settled(outcome.job_id().unwrap()).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert!(ctx.context("sub-flaky").await.is_terminal());
    assert_eq!(ctx.mocks.panel.server_ids().await.len(), 1);
    assert_eq!(ctx.mocks.compute.call_count("create_node").await, 1);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_and_keep_partial_ids() {
    let ctx = TestContext::new(3).await;
    ctx.mocks
        .dns
        .fail_next("create_record", unavailable("dns"), 10)
        .await;

    let outcome = ctx
        .service
        .request_create("sub-doomed", spec(NodeClass::Cloud))
        .await
        .unwrap();
    let job = ctx.run_until_settled(outcome.job_id().unwrap()).await;

    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 3);
    assert!(job.error_message.unwrap().contains("sub-doomed"));
    assert_eq!(ctx.mocks.dns.call_count("create_record").await, 3);

    let context = ctx.context("sub-doomed").await;
    assert_eq!(context.status(), ContextStatus::Failed);
    assert_eq!(context.step_type(), StepType::ARecord);
    assert!(context.current().node_id.is_some());
    assert_eq!(
        ctx.queue.count_by_status(JobStatus::DeadLetter).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_migration_end_to_end() {
    let ctx = TestContext::new(5).await;
    let created = ctx
        .service
        .request_create("sub-move", spec(NodeClass::Cloud))
        .await
        .unwrap();
    ctx.run_until_settled(created.job_id().unwrap()).await;
    let old = ctx.context("sub-move").await.current().clone();

    let migrated = ctx
        .service
        .request_migration("sub-move", spec(NodeClass::Dedicated))
        .await
        .unwrap();
    let job = ctx.run_until_settled(migrated.job_id().unwrap()).await;
    assert_eq!(job.status, JobStatus::Completed);

    let context = ctx.context("sub-move").await;
    assert_eq!(context.mode(), ProvisioningMode::MigrateDestroy);
    assert!(context.is_terminal());
    assert_eq!(context.state(), ProvisioningState::Ready);
    assert_eq!(context.generation(), 1);
    assert!(context.new_resources().is_empty());
    assert_eq!(context.spec().node_class, NodeClass::Dedicated);

    let live = context.current().clone();
    assert_ne!(live.node_id, old.node_id);
    assert_ne!(live.panel_server_id, old.panel_server_id);

    // Only the new generation is left at the providers
    assert_eq!(
        ctx.mocks.compute.node_ids().await,
        vec![live.node_id.clone().unwrap()]
    );
    assert_eq!(
        ctx.mocks.panel.server_ids().await,
        vec![live.panel_server_id.clone().unwrap()]
    );
    assert_eq!(
        ctx.mocks.panel.node_ids().await,
        vec![live.panel_node_id.clone().unwrap()]
    );
    assert_eq!(ctx.mocks.panel.allocation_count().await, 1);

    let records = ctx.mocks.dns.records().await;
    assert_eq!(records.len(), 2);
    let cname = records
        .iter()
        .find(|r| r.kind == RecordKind::Cname)
        .unwrap();
    assert_eq!(Some(&cname.id), live.c_name_id.as_ref());
    assert_eq!(
        cname.content,
        format!("{}.{}", naming::resource_name("sub-move", 1), ZONE)
    );

    assert_eq!(
        ctx.mocks.installer.transfers().await,
        vec![(old.panel_server_id.unwrap(), live.panel_server_id.unwrap())]
    );
}

/// READY that files a destroy request the first time it opens a
/// MIGRATE_DESTROY run, then does its usual work.
struct DestroyOnMigrateDestroy {
    inner: Arc<dyn Step>,
    service: ProvisioningService,
    requested: AtomicBool,
}

#[async_trait]
impl Step for DestroyOnMigrateDestroy {
    fn step_type(&self) -> StepType {
        StepType::Ready
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        if context.mode() == ProvisioningMode::MigrateDestroy
            && !self.requested.swap(true, Ordering::SeqCst)
        {
            let outcome = self
                .service
                .request_destroy(context.subscription_id())
                .await
                .unwrap();
            // The running migration job absorbs the request
            assert!(outcome.job_id().is_none());
        }
        self.inner.execute(context).await
    }
}

#[tokio::test]
async fn test_destroy_between_migration_halves_wins() {
    let mut ctx = TestContext::new(5).await;
    let created = ctx
        .service
        .request_create("sub-flip", spec(NodeClass::Cloud))
        .await
        .unwrap();
    ctx.run_until_settled(created.job_id().unwrap()).await;

    let mut steps = StepRegistry::standard(ctx.mocks.as_providers(), settings());
    let ready = steps.get(StepType::Ready).unwrap();
    steps.register(Arc::new(DestroyOnMigrateDestroy {
        inner: ready,
        service: ctx.service.clone(),
        requested: AtomicBool::new(false),
    }));
    ctx.worker = worker_with_steps(&ctx.store, &ctx.mocks, steps, JobWorkerConfig::default());

    let migrated = ctx
        .service
        .request_migration("sub-flip", spec(NodeClass::Dedicated))
        .await
        .unwrap();
    let job = ctx.run_until_settled(migrated.job_id().unwrap()).await;

    // The stale MIGRATE_DESTROY save was rejected and the retry ran the destroy
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    let context = ctx.context("sub-flip").await;
    assert_eq!(context.mode(), ProvisioningMode::Destroy);
    assert!(context.is_terminal());
    assert_eq!(context.state(), ProvisioningState::Shutdown);
    assert!(context.current().is_empty());
    assert!(context.new_resources().is_empty());

    // Both generations are gone
    assert!(ctx.mocks.compute.node_ids().await.is_empty());
    assert!(ctx.mocks.panel.server_ids().await.is_empty());
    assert!(ctx.mocks.panel.node_ids().await.is_empty());
    assert_eq!(ctx.mocks.panel.allocation_count().await, 0);
    assert!(ctx.mocks.dns.records().await.is_empty());
}

#[tokio::test]
async fn test_destroy_end_to_end() {
    let ctx = TestContext::new(5).await;
    let created = ctx
        .service
        .request_create("sub-gone", spec(NodeClass::Cloud))
        .await
        .unwrap();
    ctx.run_until_settled(created.job_id().unwrap()).await;

    let destroyed = ctx.service.request_destroy("sub-gone").await.unwrap();
    let job = ctx.run_until_settled(destroyed.job_id().unwrap()).await;
    assert_eq!(job.status, JobStatus::Completed);

    let context = ctx.context("sub-gone").await;
    assert_eq!(context.mode(), ProvisioningMode::Destroy);
    assert!(context.is_terminal());
    assert_eq!(context.state(), ProvisioningState::Shutdown);
    assert!(context.current().is_empty());

    assert!(ctx.mocks.compute.node_ids().await.is_empty());
    assert!(ctx.mocks.panel.node_ids().await.is_empty());
    assert!(ctx.mocks.panel.server_ids().await.is_empty());
    assert_eq!(ctx.mocks.panel.allocation_count().await, 0);
    assert!(ctx.mocks.dns.records().await.is_empty());

    // A destroyed subscription can be provisioned again from scratch
    let again = ctx
        .service
        .request_create("sub-gone", spec(NodeClass::Cloud))
        .await
        .unwrap();
    let job = ctx.run_until_settled(again.job_id().unwrap()).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(ctx.mocks.compute.node_ids().await.len(), 1);
}

#[tokio::test]
async fn test_destroy_request_collapses_into_queued_job() {
    let ctx = TestContext::new(5).await;
    let created = ctx
        .service
        .request_create("sub-quick", spec(NodeClass::Cloud))
        .await
        .unwrap();
    ctx.run_until_settled(created.job_id().unwrap()).await;

    let first = ctx.service.request_destroy("sub-quick").await.unwrap();
    assert!(first.job_id().is_some());
    // Refused: the destroy run is already in progress
    assert!(ctx.service.request_destroy("sub-quick").await.is_err());

    let outcome = ctx
        .queue
        .enqueue(JobType::Provision, "sub-quick", None, None)
        .await
        .unwrap();
    assert!(outcome.job_id().is_none());
    assert_eq!(
        ctx.queue.count_by_status(JobStatus::Pending).await.unwrap(),
        1
    );
}
