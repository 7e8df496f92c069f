// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job polling loop and bounded worker pool.
//!
//! Every poll:
//! 1. Revokes the claim of RUNNING jobs with a stale heartbeat (their worker
//!    died); each counts as a failed attempt
//! 2. Measures free capacity in the pool
//! 3. Claims PENDING jobs for 70% of it, then RETRYING jobs for the rest
//! 4. Runs each claimed job on its own task holding one pool permit
//!
//! A job's outcome is always written back as a status update; nothing a
//! processor does, panics included, escapes the task. Every write carries the
//! claim id, so a worker whose claim was revoked cannot settle the job for
//! whoever holds it now.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use hearth_core::job::{Job, JobStatus};
use hearth_core::persistence::Persistence;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use super::{ProcessorError, ProcessorRegistry, RetryPolicy};
use crate::config::ConfigError;
use crate::error::{Error, Result};

/// Share of free capacity offered to PENDING jobs, in tenths.
const PENDING_SHARE_TENTHS: usize = 7;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Maximum jobs running at once.
    pub pool_size: usize,
    /// How often to claim new work.
    pub poll_interval: Duration,
    /// RUNNING jobs without a heartbeat for this long are requeued.
    pub stale_after: Duration,
    /// How often a running job refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for running jobs.
    pub shutdown_grace: Duration,
}

impl JobWorkerConfig {
    /// Reject settings under which a healthy job would be declared dead.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.stale_after {
            return Err(ConfigError::Invalid {
                var: "HEARTH_JOB_HEARTBEAT_INTERVAL_SECS",
                value: format!(
                    "{}s (must be non-zero and below the {}s stale threshold)",
                    self.heartbeat_interval.as_secs(),
                    self.stale_after.as_secs()
                ),
            });
        }
        Ok(())
    }
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

impl JobWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEARTH_WORKER_POOL_SIZE`: maximum concurrent jobs (default: 8)
    /// - `HEARTH_JOB_POLL_INTERVAL_SECS`: seconds between claims (default: 5)
    /// - `HEARTH_JOB_STALE_AFTER_SECS`: heartbeat age that counts as dead (default: 300)
    /// - `HEARTH_JOB_HEARTBEAT_INTERVAL_SECS`: heartbeat period (default: 30)
    /// - `HEARTH_JOB_SHUTDOWN_GRACE_SECS`: wait for running jobs on shutdown (default: 60)
    ///
    /// The heartbeat interval must stay below the stale threshold.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let pool_size = std::env::var("HEARTH_WORKER_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(8);

        let secs = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        let config = Self {
            pool_size,
            poll_interval: Duration::from_secs(secs("HEARTH_JOB_POLL_INTERVAL_SECS", 5)),
            stale_after: Duration::from_secs(secs("HEARTH_JOB_STALE_AFTER_SECS", 300)),
            heartbeat_interval: Duration::from_secs(secs(
                "HEARTH_JOB_HEARTBEAT_INTERVAL_SECS",
                30,
            )),
            shutdown_grace: Duration::from_secs(secs("HEARTH_JOB_SHUTDOWN_GRACE_SECS", 60)),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Runs one claimed job to a final status update.
#[derive(Clone)]
struct JobRunner {
    persistence: Arc<dyn Persistence>,
    processors: Arc<ProcessorRegistry>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
}

impl JobRunner {
    async fn run(&self, job: Job) {
        let Some(claim_id) = job.claim_id.clone() else {
            error!(job_id = %job.job_id, status = %job.status, "Refusing to run an unclaimed job");
            return;
        };

        let heartbeat = self.spawn_heartbeat(job.job_id.clone(), claim_id.clone());
        let outcome = self.invoke(&job).await;
        heartbeat.abort();

        if let Err(e) = self.settle(&job, &claim_id, outcome).await {
            error!(job_id = %job.job_id, error = %e, "Failed to record job outcome");
        }
    }

    fn spawn_heartbeat(&self, job_id: String, claim_id: String) -> tokio::task::JoinHandle<()> {
        let persistence = self.persistence.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match persistence.heartbeat_job(&job_id, &claim_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "Job claim was revoked, stopping heartbeat");
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to refresh job heartbeat")
                    }
                }
            }
        })
    }

    async fn invoke(&self, job: &Job) -> std::result::Result<(), ProcessorError> {
        let Some(processor) = self.processors.get(job.job_type) else {
            return Err(ProcessorError::Retriable(format!(
                "no processor found for job type: {}",
                job.job_type
            )));
        };
        debug!(job_id = %job.job_id, job_type = %job.job_type, "Processing job");
        match AssertUnwindSafe(processor.process(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(ProcessorError::Retriable(format!(
                "processor panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    async fn settle(
        &self,
        job: &Job,
        claim_id: &str,
        outcome: std::result::Result<(), ProcessorError>,
    ) -> Result<()> {
        let error = match outcome {
            Ok(()) => {
                if self.persistence.complete_job(&job.job_id, claim_id).await? {
                    info!(job_id = %job.job_id, job_type = %job.job_type, "Job completed");
                } else {
                    warn!(job_id = %job.job_id, "Job claim was revoked before it completed");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        let attempts = job.retry_count.saturating_add(1);
        if error.is_fatal() || job.retries_exhausted() {
            let retry_count = attempts.min(job.maximum_retries.max(1));
            let settled = self
                .persistence
                .move_to_dead_letter(&job.job_id, claim_id, retry_count, &error.to_string())
                .await?;
            if !settled {
                warn!(job_id = %job.job_id, error = %error, "Job claim was revoked before it failed");
                return Ok(());
            }
            error!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                payload = %job.payload,
                retry_count,
                fatal = error.is_fatal(),
                error = %error,
                "Job moved to dead letter"
            );
            return Ok(());
        }

        let delay = self.retry.backoff(job.retry_count);
        let delayed_until = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| Error::Other(format!("Invalid backoff: {}", e)))?;
        let settled = self
            .persistence
            .update_job_for_retry(
                &job.job_id,
                claim_id,
                attempts,
                delayed_until,
                &error.to_string(),
            )
            .await?;
        if !settled {
            warn!(job_id = %job.job_id, error = %error, "Job claim was revoked before it failed");
            return Ok(());
        }
        warn!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            retry_count = attempts,
            maximum_retries = job.maximum_retries,
            backoff_secs = delay.as_secs(),
            error = %error,
            "Job failed, scheduled for retry"
        );
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Claims jobs and runs them on a bounded pool.
pub struct JobWorker {
    persistence: Arc<dyn Persistence>,
    runner: JobRunner,
    config: JobWorkerConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl JobWorker {
    /// Create a worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        processors: ProcessorRegistry,
        retry: RetryPolicy,
        config: JobWorkerConfig,
    ) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            runner: JobRunner {
                persistence: persistence.clone(),
                processors: Arc::new(processors),
                retry,
                heartbeat_interval: config.heartbeat_interval,
            },
            persistence,
            permits: Arc::new(Semaphore::new(pool_size)),
            config: JobWorkerConfig {
                pool_size,
                ..config
            },
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the polling loop until shutdown, then wait for running jobs.
    pub async fn run(&self) {
        info!(
            pool_size = self.config.pool_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Job worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to poll for jobs");
                    }
                }
            }
        }

        match tokio::time::timeout(self.config.shutdown_grace, self.drain()).await {
            Ok(()) => info!("Job worker stopped"),
            Err(_) => warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Job worker stopped with jobs still running; they will be requeued once stale"
            ),
        }
    }

    /// One poll: revoke stale claims, claim up to free capacity and spawn.
    ///
    /// Returns how many jobs were claimed.
    pub async fn poll_once(&self) -> Result<usize> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(self.config.stale_after)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let stale = self.persistence.requeue_stale_jobs(stale_cutoff).await?;
        if stale.total() > 0 {
            warn!(
                requeued = stale.requeued,
                dead_lettered = stale.dead_lettered,
                "Revoked claims of jobs with stale heartbeats"
            );
        }

        let available = self.permits.available_permits();
        if available == 0 {
            debug!("Worker pool is full, skipping claim");
            return Ok(0);
        }

        let pending_quota = (available * PENDING_SHARE_TENTHS).div_ceil(10);
        let mut claimed = self
            .persistence
            .claim_jobs(JobStatus::Pending, pending_quota as i64, now)
            .await?;
        let retry_quota = available.saturating_sub(claimed.len());
        if retry_quota > 0 {
            claimed.extend(
                self.persistence
                    .claim_jobs(JobStatus::Retrying, retry_quota as i64, now)
                    .await?,
            );
        }

        let count = claimed.len();
        for job in claimed {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Other(format!("Worker pool closed: {}", e)))?;
            let runner = self.runner.clone();
            tokio::spawn(async move {
                runner.run(job).await;
                drop(permit);
            });
        }

        if count > 0 {
            debug!(claimed = count, available, "Claimed jobs");
        }
        Ok(count)
    }

    /// Run a job on the current task. The job must already be claimed.
    pub async fn process_job(&self, job: Job) {
        self.runner.run(job).await;
    }

    /// Wait until no job is running.
    pub async fn drain(&self) {
        let all = self.config.pool_size as u32;
        // The semaphore is never closed, so this only waits
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
    }
}
