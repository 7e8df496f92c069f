// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic reconciliation sweeps.
//!
//! The scheduler never reconciles inline. Each tick enqueues one RECONCILE
//! job per resource type, so sweeps share the worker pool and retry budget
//! with all other work and duplicate requests collapse on the dedup key. A
//! short-lived lock keeps several instances from all enqueueing on the same
//! tick; it is left to expire rather than released.

use std::sync::Arc;

use hearth_core::job::{EnqueueOutcome, JobType};
use hearth_core::persistence::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::{ReconcileConfig, ResourceType};
use crate::error::{Error, Result};
use crate::jobs::JobQueue;

const LOCK_NAME: &str = "reconcile_scheduler";

/// Background loop that enqueues reconciliation jobs.
pub struct ReconcileScheduler {
    queue: JobQueue,
    persistence: Arc<dyn Persistence>,
    config: ReconcileConfig,
    holder: String,
    shutdown: Arc<Notify>,
}

impl ReconcileScheduler {
    /// Create a scheduler.
    pub fn new(queue: JobQueue, persistence: Arc<dyn Persistence>, config: ReconcileConfig) -> Self {
        Self {
            queue,
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

    /// Run the scheduling loop until shutdown.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Reconciliation scheduler disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace_period.as_secs(),
            "Reconciliation scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciliation scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to schedule reconciliation");
                    }
                }
            }
        }

        info!("Reconciliation scheduler stopped");
    }

    /// Enqueue a sweep for every resource type.
    ///
    /// Returns `None` when another instance scheduled this tick, otherwise
    /// the number of newly created jobs.
    pub async fn run_once(&self) -> Result<Option<usize>> {
        let ttl = chrono::Duration::from_std(self.config.interval / 2)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        if !self
            .persistence
            .try_acquire_lock(LOCK_NAME, &self.holder, ttl)
            .await?
        {
            debug!("Another instance is scheduling reconciliation, skipping");
            return Ok(None);
        }

        let mut created = 0;
        for resource_type in ResourceType::ALL {
            let outcome = self
                .queue
                .enqueue(JobType::Reconcile, resource_type.as_str(), None, None)
                .await?;
            if let EnqueueOutcome::Created(_) = outcome {
                created += 1;
            }
        }
        info!(created, "Reconciliation sweeps scheduled");
        Ok(Some(created))
    }
}
