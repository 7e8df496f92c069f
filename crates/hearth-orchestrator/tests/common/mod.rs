// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hearth-orchestrator integration tests.
//!
//! Provides TestContext: an in-memory SQLite store, mock providers, and the
//! queue, service and worker wired the way the runtime wires them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hearth_core::context::{NodeClass, ProvisioningContext, ServerSpec};
use hearth_core::job::Job;
use hearth_core::persistence::{Persistence, SqlitePersistence};
use hearth_orchestrator::executor::StepExecutor;
use hearth_orchestrator::jobs::{
    JobQueue, JobWorker, JobWorkerConfig, ProcessorRegistry, ProvisioningProcessor,
    ReconcileProcessor, RetryPolicy,
};
use hearth_orchestrator::providers::mock::MockProviders;
use hearth_orchestrator::reconcile::{ReconcileConfig, ReconcileEngine};
use hearth_orchestrator::service::ProvisioningService;
use hearth_orchestrator::steps::{StepRegistry, StepSettings};
use sqlx::sqlite::SqlitePoolOptions;

pub const ZONE: &str = "games.test";

/// Fast step settings: 1ms boot polling.
pub fn settings() -> StepSettings {
    StepSettings {
        dns_zone: ZONE.to_string(),
        node_ready_timeout: Duration::from_secs(10),
        node_poll_interval: Duration::from_millis(1),
    }
}

/// A small server.
pub fn spec(class: NodeClass) -> ServerSpec {
    ServerSpec {
        region: "fsn1".to_string(),
        size_class: "cx32".to_string(),
        node_class: class,
        image: "debian-12".to_string(),
        egg_id: 3,
        memory_mb: 4096,
        disk_mb: 20480,
        cpu_limit: 200,
        game_port: 25565,
    }
}

/// Retries become eligible immediately.
pub fn immediate_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::ZERO,
        max: Duration::ZERO,
    }
}

/// Fresh in-memory store with migrations applied.
pub async fn memory_store() -> Arc<dyn Persistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    hearth_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
}

/// Test context holding the full job stack over mock providers.
pub struct TestContext {
    pub store: Arc<dyn Persistence>,
    pub mocks: MockProviders,
    pub queue: JobQueue,
    pub service: ProvisioningService,
    pub worker: JobWorker,
}

impl TestContext {
    /// Context with a retry budget of `max_retries` per job.
    pub async fn new(max_retries: i32) -> Self {
        let store = memory_store().await;
        Self::with_store(store, MockProviders::default(), max_retries, JobWorkerConfig::default())
    }

    /// Context over an existing store and mocks.
    pub fn with_store(
        store: Arc<dyn Persistence>,
        mocks: MockProviders,
        max_retries: i32,
        worker_config: JobWorkerConfig,
    ) -> Self {
        let worker = worker(&store, &mocks, worker_config);
        let queue = JobQueue::new(store.clone(), max_retries);
        let service = ProvisioningService::new(store.clone(), queue.clone());
        Self {
            store,
            mocks,
            queue,
            service,
            worker,
        }
    }

    /// Poll and wait until `job_id` is COMPLETED or DEAD_LETTER.
    pub async fn run_until_settled(&self, job_id: &str) -> Job {
        for _ in 0..20 {
            self.worker.poll_once().await.expect("poll failed");
            self.worker.drain().await;
            let job = self
                .queue
                .get_job(job_id)
                .await
                .expect("get_job failed")
                .expect("job vanished");
            if job.status.is_terminal() {
                return job;
            }
        }
        panic!("job {} never settled", job_id);
    }

    /// Stored context of `subscription_id`.
    pub async fn context(&self, subscription_id: &str) -> ProvisioningContext {
        self.store
            .load_context(subscription_id)
            .await
            .expect("load_context failed")
            .expect("no context stored")
    }
}

/// Worker with the standard processors over `mocks`.
pub fn worker(
    store: &Arc<dyn Persistence>,
    mocks: &MockProviders,
    config: JobWorkerConfig,
) -> JobWorker {
    let steps = StepRegistry::standard(mocks.as_providers(), settings());
    worker_with_steps(store, mocks, steps, config)
}

/// Worker whose PROVISION jobs run `steps`.
pub fn worker_with_steps(
    store: &Arc<dyn Persistence>,
    mocks: &MockProviders,
    steps: StepRegistry,
    config: JobWorkerConfig,
) -> JobWorker {
    let providers = mocks.as_providers();
    let executor = Arc::new(StepExecutor::new(Arc::new(steps), store.clone()));
    let engine = Arc::new(ReconcileEngine::standard(
        store.clone(),
        &providers,
        ReconcileConfig::default(),
    ));
    let processors = ProcessorRegistry::new()
        .register(Arc::new(ProvisioningProcessor::new(store.clone(), executor)))
        .register(Arc::new(ReconcileProcessor::new(engine)));
    JobWorker::new(store.clone(), processors, immediate_retry(), config)
}
