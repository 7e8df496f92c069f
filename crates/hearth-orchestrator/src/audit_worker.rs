// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that archives old completed jobs.
//!
//! Each run:
//! 1. Takes the `job_audit` lock (skips quietly if another instance has it)
//! 2. Copies COMPLETED jobs older than the retention period into
//!    `job_archive` and deletes them, one batch per transaction
//! 3. Releases the lock
//!
//! The lock carries a TTL so a crashed holder does not block cleanup forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hearth_core::persistence::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

const LOCK_NAME: &str = "job_audit";

/// Configuration for the job audit worker.
#[derive(Debug, Clone)]
pub struct JobAuditWorkerConfig {
    /// Whether archival runs at all.
    pub enabled: bool,
    /// How often to run.
    pub poll_interval: Duration,
    /// Completed jobs younger than this stay in the live table.
    pub retention: Duration,
    /// Jobs per archival transaction.
    pub batch_size: i64,
    /// How long the lock is held before another instance may take it.
    pub lock_ttl: Duration,
}

impl Default for JobAuditWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600),       // 1 hour
            retention: Duration::from_secs(7 * 24 * 3600), // 7 days
            batch_size: 500,
            lock_ttl: Duration::from_secs(600),
        }
    }
}

impl JobAuditWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEARTH_JOB_AUDIT_ENABLED`: "true" or "1" to enable (default: true)
    /// - `HEARTH_JOB_AUDIT_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `HEARTH_JOB_RETENTION_DAYS`: days completed jobs are kept (default: 7)
    /// - `HEARTH_JOB_AUDIT_BATCH_SIZE`: jobs per transaction (default: 500)
    /// - `HEARTH_JOB_AUDIT_LOCK_TTL_SECS`: lock lifetime (default: 600)
    pub fn from_env() -> Self {
        let enabled = std::env::var("HEARTH_JOB_AUDIT_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let poll_interval_secs = std::env::var("HEARTH_JOB_AUDIT_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let retention_days = std::env::var("HEARTH_JOB_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(7);

        let batch_size = std::env::var("HEARTH_JOB_AUDIT_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &i64| *n > 0)
            .unwrap_or(500);

        let lock_ttl_secs = std::env::var("HEARTH_JOB_AUDIT_LOCK_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            retention: Duration::from_secs(retention_days * 24 * 3600),
            batch_size,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
        }
    }
}

/// Archives completed jobs past retention.
pub struct JobAuditWorker {
    persistence: Arc<dyn Persistence>,
    config: JobAuditWorkerConfig,
    holder: String,
    shutdown: Arc<Notify>,
}

impl JobAuditWorker {
    /// Create a new job audit worker.
    pub fn new(persistence: Arc<dyn Persistence>, config: JobAuditWorkerConfig) -> Self {
        Self {
            persistence,
            config,
            holder: uuid::Uuid::new_v4().to_string(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the audit loop until shutdown.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Job audit worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_days = self.config.retention.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Job audit worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job audit worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to archive completed jobs");
                    }
                }
            }
        }

        info!("Job audit worker stopped");
    }

    /// One archival pass.
    ///
    /// Returns `None` if another instance holds the lock, otherwise the
    /// number of jobs archived.
    pub async fn run_once(&self) -> Result<Option<u64>> {
        let ttl = chrono::Duration::from_std(self.config.lock_ttl)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        if !self
            .persistence
            .try_acquire_lock(LOCK_NAME, &self.holder, ttl)
            .await?
        {
            debug!("Job audit lock held by another instance, skipping");
            return Ok(None);
        }

        let archived = self.archive().await;

        match self.persistence.release_lock(LOCK_NAME, &self.holder).await {
            Ok(true) => {}
            Ok(false) => warn!("Job audit lock expired before release"),
            Err(e) => warn!(error = %e, "Failed to release job audit lock"),
        }

        archived.map(Some)
    }

    async fn archive(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let mut total = 0u64;
        loop {
            let outcome = self
                .persistence
                .archive_completed_jobs(cutoff, self.config.batch_size)
                .await?;
            total += outcome.archived;

            debug!(
                archived = outcome.archived,
                deleted = outcome.deleted,
                total,
                "Archived batch of completed jobs"
            );

            if outcome.archived < self.config.batch_size as u64 {
                break;
            }
        }

        if total > 0 {
            info!(total, cutoff = %cutoff, "Job audit cycle completed");
        } else {
            debug!("Job audit cycle completed, no old jobs found");
        }
        Ok(total)
    }
}
