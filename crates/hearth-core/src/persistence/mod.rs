// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for hearth-core.
//!
//! The [`Persistence`] trait is the single coordination point shared by every
//! worker and every process: besides plain CRUD it exposes the three atomic
//! primitives the orchestrator relies on (dedup-insert, conditional claim and
//! the named TTL lock).

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{ProvisioningContext, ResourceIds, ServerSpec};
use crate::error::CoreError;
use crate::job::{ArchiveOutcome, EnqueueOutcome, Job, JobStatus, NewJob, StaleJobsOutcome};

/// Provisioning context row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContextRecord {
    /// Subscription primary key.
    pub subscription_id: String,
    /// Current step.
    pub step_type: String,
    /// Mode of the current run.
    pub mode: String,
    /// Run status.
    pub status: String,
    /// Server-level milestone.
    pub state: String,
    /// Migration generation.
    pub generation: i64,
    /// JSON-encoded [`ServerSpec`].
    pub spec: String,
    /// JSON-encoded live [`ResourceIds`].
    pub current_resources: String,
    /// JSON-encoded replacement [`ResourceIds`].
    pub new_resources: String,
    /// First save.
    pub created_at: DateTime<Utc>,
    /// Last save.
    pub updated_at: DateTime<Utc>,
    /// Bumped by every save.
    pub version: i64,
}

impl TryFrom<ContextRecord> for ProvisioningContext {
    type Error = CoreError;

    fn try_from(row: ContextRecord) -> Result<Self, Self::Error> {
        let spec: ServerSpec = serde_json::from_str(&row.spec)
            .map_err(|e| CoreError::decode("spec", e))?;
        let current: ResourceIds = serde_json::from_str(&row.current_resources)
            .map_err(|e| CoreError::decode("current_resources", e))?;
        let new: ResourceIds = serde_json::from_str(&row.new_resources)
            .map_err(|e| CoreError::decode("new_resources", e))?;

        Ok(ProvisioningContext {
            subscription_id: row.subscription_id,
            step_type: row.step_type.parse()?,
            mode: row.mode.parse()?,
            status: row.status.parse()?,
            state: row.state.parse()?,
            generation: row.generation,
            spec,
            current,
            new,
            version: row.version,
        })
    }
}

/// Column values of a context ready to bind.
pub(crate) struct EncodedContext<'a> {
    pub subscription_id: &'a str,
    pub step_type: &'static str,
    pub mode: &'static str,
    pub status: &'static str,
    pub state: &'static str,
    pub generation: i64,
    pub spec: String,
    pub current: String,
    pub new: String,
    pub snapshot: String,
    pub expected_version: i64,
}

/// Resource snapshot stored with every transition row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Live resources at the time of the save.
    pub current: ResourceIds,
    /// Replacement resources at the time of the save.
    pub new: ResourceIds,
}

impl<'a> EncodedContext<'a> {
    pub(crate) fn encode(ctx: &'a ProvisioningContext) -> Result<Self, CoreError> {
        let snapshot = ResourceSnapshot {
            current: ctx.current.clone(),
            new: ctx.new.clone(),
        };
        Ok(Self {
            subscription_id: &ctx.subscription_id,
            step_type: ctx.step_type.as_str(),
            mode: ctx.mode.as_str(),
            status: ctx.status.as_str(),
            state: ctx.state.as_str(),
            generation: ctx.generation,
            spec: serde_json::to_string(&ctx.spec)?,
            current: serde_json::to_string(&ctx.current)?,
            new: serde_json::to_string(&ctx.new)?,
            snapshot: serde_json::to_string(&snapshot)?,
            expected_version: ctx.version,
        })
    }
}

/// One row of the transition audit trail.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransitionRecord {
    /// Monotonic row id.
    pub id: i64,
    /// Subscription the snapshot belongs to.
    pub subscription_id: String,
    /// Step at the time of the save.
    pub step_type: String,
    /// Mode at the time of the save.
    pub mode: String,
    /// Status at the time of the save.
    pub status: String,
    /// Server-level milestone at the time of the save.
    pub state: String,
    /// Migration generation at the time of the save.
    pub generation: i64,
    /// JSON-encoded [`ResourceSnapshot`].
    pub resources: String,
    /// When the snapshot was written.
    pub recorded_at: DateTime<Utc>,
}

impl TransitionRecord {
    /// Decode the resource snapshot.
    pub fn snapshot(&self) -> Result<ResourceSnapshot, CoreError> {
        serde_json::from_str(&self.resources).map_err(|e| CoreError::decode("resources", e))
    }
}

/// Job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Unique id.
    pub job_id: String,
    /// Identity of the work.
    pub dedup_key: String,
    /// Job type string.
    pub job_type: String,
    /// Status string.
    pub status: String,
    /// Opaque processor input.
    pub payload: String,
    /// Failed attempts so far.
    pub retry_count: i32,
    /// Retry budget.
    pub maximum_retries: i32,
    /// Last failure.
    pub error_message: Option<String>,
    /// Earliest eligible claim time.
    pub delayed_until: Option<DateTime<Utc>>,
    /// Token of the current claim.
    pub claim_id: Option<String>,
    /// Current claim time.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last worker heartbeat.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = CoreError;

    fn try_from(row: JobRecord) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: row.job_id,
            dedup_key: row.dedup_key,
            job_type: row.job_type.parse()?,
            status: row.status.parse()?,
            payload: row.payload,
            retry_count: row.retry_count,
            maximum_retries: row.maximum_retries,
            error_message: row.error_message,
            delayed_until: row.delayed_until,
            claim_id: row.claim_id,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Error message recorded on jobs settled by [`Persistence::requeue_stale_jobs`].
pub const STALE_CLAIM_MESSAGE: &str = "worker heartbeat lost";

pub(crate) fn decode_jobs(rows: Vec<JobRecord>) -> Result<Vec<Job>, CoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Column list shared by every job SELECT/RETURNING.
pub(crate) const JOB_COLUMNS: &str = "job_id, dedup_key, job_type, status, payload, retry_count, \
     maximum_retries, error_message, delayed_until, claim_id, claimed_at, heartbeat_at, \
     created_at, updated_at, completed_at";

/// Durable repository for contexts, jobs and locks.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- provisioning contexts ----

    /// Write the context and append a transition row, in one transaction.
    ///
    /// The write only applies while the stored version still equals
    /// `context.version()` (no row at all for version 0). Otherwise nothing is
    /// written and [`CoreError::ContextConflict`] is returned. On success the
    /// saved copy with its bumped version is returned; later writes must
    /// derive from it.
    async fn save_context(
        &self,
        context: &ProvisioningContext,
    ) -> Result<ProvisioningContext, CoreError>;

    /// Load the context of a subscription.
    async fn load_context(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProvisioningContext>, CoreError>;

    /// Every stored context, ordered by subscription id.
    async fn list_contexts(&self) -> Result<Vec<ProvisioningContext>, CoreError>;

    /// Transition audit trail of a subscription, oldest first.
    async fn list_transitions(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<TransitionRecord>, CoreError>;

    // ---- jobs ----

    /// Insert a PENDING job unless an active job with the same dedup key
    /// exists. Check and insert are one atomic statement.
    async fn enqueue_job(
        &self,
        job: &NewJob,
        delayed_until: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, CoreError>;

    /// Atomically move up to `limit` eligible jobs in `status` to RUNNING and
    /// return exactly the rows this call moved, each carrying a fresh
    /// `claim_id`.
    async fn claim_jobs(
        &self,
        status: JobStatus,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, CoreError>;

    /// RUNNING -> COMPLETED. Returns false unless the job is RUNNING under
    /// `claim_id`.
    async fn complete_job(&self, job_id: &str, claim_id: &str) -> Result<bool, CoreError>;

    /// RUNNING -> RETRYING with the new retry count and backoff. Fenced by
    /// `claim_id` like [`Persistence::complete_job`].
    async fn update_job_for_retry(
        &self,
        job_id: &str,
        claim_id: &str,
        retry_count: i32,
        delayed_until: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, CoreError>;

    /// RUNNING -> DEAD_LETTER. Fenced by `claim_id`.
    async fn move_to_dead_letter(
        &self,
        job_id: &str,
        claim_id: &str,
        retry_count: i32,
        error_message: &str,
    ) -> Result<bool, CoreError>;

    /// Refresh the liveness stamp of a job still RUNNING under `claim_id`.
    async fn heartbeat_job(&self, job_id: &str, claim_id: &str) -> Result<bool, CoreError>;

    /// Settle RUNNING jobs whose heartbeat is older than `older_than`.
    ///
    /// A lost worker counts as a failed attempt: jobs with budget left go to
    /// RETRYING with `retry_count + 1`, the others to DEAD_LETTER. Either way
    /// the claim is revoked.
    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<StaleJobsOutcome, CoreError>;

    /// Fetch one job.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, CoreError>;

    /// Number of jobs in `status`.
    async fn count_jobs_by_status(&self, status: JobStatus) -> Result<i64, CoreError>;

    /// Copy up to `batch_size` COMPLETED jobs finished before `older_than`
    /// into the archive and delete them, in one transaction.
    async fn archive_completed_jobs(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<ArchiveOutcome, CoreError>;

    /// Number of archived jobs.
    async fn count_archived_jobs(&self) -> Result<i64, CoreError>;

    // ---- mutual exclusion ----

    /// Take the named lock for `ttl` unless another holder has an unexpired
    /// claim. Re-acquiring a lock already held by `holder` extends it.
    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Release the named lock if `holder` owns it.
    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, CoreError>;

    /// Simple connectivity check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
