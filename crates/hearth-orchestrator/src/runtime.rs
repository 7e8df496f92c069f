// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hearth-orchestrator.
//!
//! [`OrchestratorRuntime`] wires the step registry, executor, processors and
//! reconcilers onto a persistence backend and a set of provider clients, and
//! runs the background loops inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hearth_core::persistence::SqlitePersistence;
//! use hearth_orchestrator::providers::Providers;
//! use hearth_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::SqlitePool::connect("sqlite:hearth.db").await?;
//!     hearth_core::migrations::run_sqlite(&pool).await?;
//!     let (providers, _mocks) = Providers::mock();
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .persistence(Arc::new(SqlitePersistence::new(pool)))
//!         .providers(providers)
//!         .dns_zone("games.example.com")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.service().request_create("sub-1", spec).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use hearth_core::context::ProvisioningMode;
use hearth_core::persistence::Persistence;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::audit_worker::{JobAuditWorker, JobAuditWorkerConfig};
use crate::config::Config;
use crate::executor::StepExecutor;
use crate::jobs::{
    JobQueue, JobWorker, JobWorkerConfig, ProcessorRegistry, ProvisioningProcessor,
    ReconcileProcessor, RetryPolicy,
};
use crate::providers::Providers;
use crate::reconcile::{ReconcileConfig, ReconcileEngine, ReconcileScheduler};
use crate::service::ProvisioningService;
use crate::steps::{StepRegistry, StepSettings};

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    providers: Option<Providers>,
    default_max_retries: i32,
    steps: StepSettings,
    worker: JobWorkerConfig,
    retry: RetryPolicy,
    audit: JobAuditWorkerConfig,
    reconcile: ReconcileConfig,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            providers: None,
            default_max_retries: 5,
            steps: StepSettings::default(),
            worker: JobWorkerConfig::default(),
            retry: RetryPolicy::default(),
            audit: JobAuditWorkerConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the provider clients (required).
    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Take every tunable from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.default_max_retries = config.default_max_retries;
        self.steps = config.steps.clone();
        self.worker = config.worker.clone();
        self.retry = config.retry;
        self.audit = config.audit.clone();
        self.reconcile = config.reconcile.clone();
        self
    }

    /// Set the DNS zone for node and customer records.
    pub fn dns_zone(mut self, zone: impl Into<String>) -> Self {
        self.steps.dns_zone = zone.into();
        self
    }

    /// Set the retry budget for jobs enqueued without one.
    ///
    /// Default: 5
    pub fn default_max_retries(mut self, retries: i32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Set step settings.
    pub fn step_settings(mut self, settings: StepSettings) -> Self {
        self.steps = settings;
        self
    }

    /// Set the job worker configuration.
    pub fn worker_config(mut self, config: JobWorkerConfig) -> Self {
        self.worker = config;
        self
    }

    /// Set the backoff policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the job audit worker configuration.
    pub fn audit_config(mut self, config: JobAuditWorkerConfig) -> Self {
        self.audit = config;
        self
    }

    /// Set the reconciliation configuration.
    pub fn reconcile_config(mut self, config: ReconcileConfig) -> Self {
        self.reconcile = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let providers = self
            .providers
            .ok_or_else(|| anyhow::anyhow!("providers are required"))?;
        if self.default_max_retries < 1 {
            anyhow::bail!("default_max_retries must be at least 1");
        }
        self.worker.validate()?;

        Ok(OrchestratorRuntimeConfig {
            persistence,
            providers,
            default_max_retries: self.default_max_retries,
            steps: self.steps,
            worker: self.worker,
            retry: self.retry,
            audit: self.audit,
            reconcile: self.reconcile,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    providers: Providers,
    default_max_retries: i32,
    steps: StepSettings,
    worker: JobWorkerConfig,
    retry: RetryPolicy,
    audit: JobAuditWorkerConfig,
    reconcile: ReconcileConfig,
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, spawning the job worker, audit worker and
    /// reconciliation scheduler.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let registry = StepRegistry::standard(self.providers.clone(), self.steps.clone());
        for mode in ProvisioningMode::ALL {
            let missing = registry.missing_for(*mode);
            if !missing.is_empty() {
                anyhow::bail!("no step registered for {:?} in {} pipeline", missing, mode);
            }
        }

        let executor = Arc::new(StepExecutor::new(
            Arc::new(registry),
            self.persistence.clone(),
        ));
        let engine = Arc::new(ReconcileEngine::standard(
            self.persistence.clone(),
            &self.providers,
            self.reconcile.clone(),
        ));
        let processors = ProcessorRegistry::new()
            .register(Arc::new(ProvisioningProcessor::new(
                self.persistence.clone(),
                executor,
            )))
            .register(Arc::new(ReconcileProcessor::new(engine)));

        let queue = JobQueue::new(self.persistence.clone(), self.default_max_retries);
        let service = ProvisioningService::new(self.persistence.clone(), queue.clone());

        // Job worker
        let worker = JobWorker::new(
            self.persistence.clone(),
            processors,
            self.retry,
            self.worker,
        );
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        // Job audit worker
        let audit_worker = JobAuditWorker::new(self.persistence.clone(), self.audit);
        let audit_shutdown = audit_worker.shutdown_handle();
        let audit_handle = tokio::spawn(async move {
            audit_worker.run().await;
        });

        // Reconciliation scheduler
        let scheduler =
            ReconcileScheduler::new(queue.clone(), self.persistence.clone(), self.reconcile);
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        info!(
            dns_zone = %self.steps.dns_zone,
            default_max_retries = self.default_max_retries,
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            worker_handle,
            audit_handle,
            scheduler_handle,
            worker_shutdown,
            audit_shutdown,
            scheduler_shutdown,
            service,
            queue,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// The runtime manages:
/// - the job worker pool that runs PROVISION and RECONCILE jobs
/// - the job audit worker that archives completed jobs
/// - the reconciliation scheduler
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    worker_handle: JoinHandle<()>,
    audit_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    audit_shutdown: Arc<Notify>,
    scheduler_shutdown: Arc<Notify>,
    service: ProvisioningService,
    queue: JobQueue,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Entry point for provisioning requests.
    pub fn service(&self) -> &ProvisioningService {
        &self.service
    }

    /// The job queue the worker polls.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every background loop, then waits for them. The job worker
    /// waits up to its shutdown grace for running jobs.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        self.audit_shutdown.notify_one();
        self.worker_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Reconciliation scheduler task panicked: {}", e);
        }

        if let Err(e) = self.audit_handle.await {
            error!("Job audit worker task panicked: {}", e);
        }

        match self.worker_handle.await {
            Ok(()) => {
                info!("OrchestratorRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Job worker task panicked: {}", e);
                Err(anyhow::anyhow!("job worker task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    ///
    /// Disabled background loops return immediately, so only the job worker
    /// is taken into account.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}
