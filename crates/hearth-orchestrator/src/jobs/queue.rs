// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Enqueue side of the job queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hearth_core::job::{EnqueueOutcome, Job, JobStatus, JobType, NewJob};
use hearth_core::persistence::Persistence;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Schedules work. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    persistence: Arc<dyn Persistence>,
    default_max_retries: i32,
}

impl JobQueue {
    /// Queue with a default retry budget for jobs that do not set one.
    pub fn new(persistence: Arc<dyn Persistence>, default_max_retries: i32) -> Self {
        Self {
            persistence,
            default_max_retries,
        }
    }

    /// Schedule `(job_type, payload)`.
    ///
    /// If the same work is already pending, retrying or running this is a
    /// no-op and returns [`EnqueueOutcome::Deduplicated`].
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: &str,
        delay: Option<Duration>,
        max_retries: Option<i32>,
    ) -> Result<EnqueueOutcome> {
        let job = NewJob::new(
            job_type,
            payload,
            max_retries.unwrap_or(self.default_max_retries).max(1),
        );
        let delayed_until = match delay {
            Some(delay) => Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .map_err(|e| Error::Other(format!("Invalid delay: {}", e)))?,
            ),
            None => None,
        };

        let outcome = self.persistence.enqueue_job(&job, delayed_until).await?;
        match &outcome {
            EnqueueOutcome::Created(job_id) => info!(
                job_id = %job_id,
                job_type = %job_type,
                payload = %payload,
                "Job enqueued"
            ),
            EnqueueOutcome::Deduplicated => debug!(
                dedup_key = %job.dedup_key(),
                "Job already queued, skipping"
            ),
        }
        Ok(outcome)
    }

    /// Look a job up by id.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.persistence.get_job(job_id).await?)
    }

    /// Number of jobs in `status`.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        Ok(self.persistence.count_jobs_by_status(status).await?)
    }
}
