// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its first claim.
    Pending,
    /// Failed at least once; eligible again once `delayed_until` passes.
    Retrying,
    /// Claimed by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Retry budget exhausted or failure was not retriable.
    DeadLetter,
}

crate::string_enum!(JobStatus, "job status" {
    Pending => "PENDING",
    Retrying => "RETRYING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    DeadLetter => "DEAD_LETTER",
});

impl JobStatus {
    /// Statuses that block a duplicate enqueue of the same work.
    pub const ACTIVE: &'static [JobStatus] =
        &[JobStatus::Pending, JobStatus::Retrying, JobStatus::Running];

    /// Whether the job will never be claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

/// What a job does. Each type has one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Run a subscription's provisioning pipeline. Payload: subscription id.
    Provision,
    /// Sweep one resource type for orphans. Payload: resource type.
    Reconcile,
}

crate::string_enum!(JobType, "job type" {
    Provision => "PROVISION",
    Reconcile => "RECONCILE",
});

/// A job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Unique id.
    pub job_id: String,
    /// Identity of the work, `"{type}::{payload}"`.
    pub dedup_key: String,
    /// Processor selector.
    pub job_type: JobType,
    /// Current status.
    pub status: JobStatus,
    /// Opaque processor input.
    pub payload: String,
    /// Failed attempts so far.
    pub retry_count: i32,
    /// Failed attempts allowed before dead-lettering.
    pub maximum_retries: i32,
    /// Last failure.
    pub error_message: Option<String>,
    /// Not eligible for claiming before this instant.
    pub delayed_until: Option<DateTime<Utc>>,
    /// Token of the current claim. Settling the job requires it, so a worker
    /// whose claim was requeued and retaken can no longer touch the row.
    pub claim_id: Option<String>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the worker holding the claim.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When the job reached COMPLETED.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Retrying)
            && self.delayed_until.is_none_or(|at| at <= now)
    }

    /// Whether another failure would exhaust the retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count + 1 >= self.maximum_retries
    }
}

/// Parameters for enqueuing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Processor selector.
    pub job_type: JobType,
    /// Opaque processor input.
    pub payload: String,
    /// Failed attempts allowed before dead-lettering.
    pub maximum_retries: i32,
}

impl NewJob {
    /// Build a job with the given retry budget.
    pub fn new(job_type: JobType, payload: impl Into<String>, maximum_retries: i32) -> Self {
        Self {
            job_type,
            payload: payload.into(),
            maximum_retries,
        }
    }

    /// Identity used to collapse duplicate enqueues.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.job_type, &self.payload)
    }
}

/// `"{type}::{payload}"`.
pub fn dedup_key(job_type: JobType, payload: &str) -> String {
    format!("{}::{}", job_type, payload)
}

/// Outcome of [`crate::Persistence::enqueue_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted.
    Created(String),
    /// Active work with the same dedup key already existed; nothing inserted.
    Deduplicated,
}

impl EnqueueOutcome {
    /// Id of the inserted job, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Created(id) => Some(id),
            Self::Deduplicated => None,
        }
    }
}

/// Result of an archival batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// Rows copied into the archive table.
    pub archived: u64,
    /// Rows removed from the live table.
    pub deleted: u64,
}

/// Result of settling jobs whose worker stopped heartbeating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleJobsOutcome {
    /// Jobs returned to RETRYING.
    pub requeued: u64,
    /// Jobs whose budget ran out and went to DEAD_LETTER.
    pub dead_lettered: u64,
}

impl StaleJobsOutcome {
    /// Total jobs whose claim was revoked.
    pub fn total(&self) -> u64 {
        self.requeued + self.dead_lettered
    }
}
