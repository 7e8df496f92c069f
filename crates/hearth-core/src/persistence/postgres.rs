// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent pollers on different
//! hosts partition the eligible rows instead of blocking on each other.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::ProvisioningContext;
use crate::error::CoreError;
use crate::job::{ArchiveOutcome, EnqueueOutcome, Job, JobStatus, NewJob, StaleJobsOutcome};

use super::{
    ContextRecord, EncodedContext, JOB_COLUMNS, JobRecord, Persistence, STALE_CLAIM_MESSAGE,
    TransitionRecord, decode_jobs,
};

const CONTEXT_COLUMNS: &str = "subscription_id, step_type, mode, status, state, generation, \
     spec::text AS spec, current_resources::text AS current_resources, \
     new_resources::text AS new_resources, created_at, updated_at, version";

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn save_context(
        &self,
        context: &ProvisioningContext,
    ) -> Result<ProvisioningContext, CoreError> {
        let row = EncodedContext::encode(context)?;
        let mut tx = self.pool.begin().await?;

        let written = if row.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO provisioning_contexts
                    (subscription_id, step_type, mode, status, state, generation, spec,
                     current_resources, new_resources, created_at, updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, $8::jsonb, $9::jsonb, NOW(), NOW(), 1)
                ON CONFLICT (subscription_id) DO NOTHING
                "#,
            )
            .bind(row.subscription_id)
            .bind(row.step_type)
            .bind(row.mode)
            .bind(row.status)
            .bind(row.state)
            .bind(row.generation)
            .bind(&row.spec)
            .bind(&row.current)
            .bind(&row.new)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE provisioning_contexts
                SET step_type = $2, mode = $3, status = $4, state = $5, generation = $6,
                    spec = $7::jsonb, current_resources = $8::jsonb, new_resources = $9::jsonb,
                    updated_at = NOW(), version = version + 1
                WHERE subscription_id = $1 AND version = $10
                "#,
            )
            .bind(row.subscription_id)
            .bind(row.step_type)
            .bind(row.mode)
            .bind(row.status)
            .bind(row.state)
            .bind(row.generation)
            .bind(&row.spec)
            .bind(&row.current)
            .bind(&row.new)
            .bind(row.expected_version)
            .execute(&mut *tx)
            .await?
        }
        .rows_affected();

        if written == 0 {
            tx.rollback().await?;
            return Err(CoreError::ContextConflict {
                subscription_id: row.subscription_id.to_string(),
                expected_version: row.expected_version,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO provisioning_transitions
                (subscription_id, step_type, mode, status, state, generation, resources, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, NOW())
            "#,
        )
        .bind(row.subscription_id)
        .bind(row.step_type)
        .bind(row.mode)
        .bind(row.status)
        .bind(row.state)
        .bind(row.generation)
        .bind(&row.snapshot)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(context.saved())
    }

    async fn load_context(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProvisioningContext>, CoreError> {
        let sql = format!(
            "SELECT {} FROM provisioning_contexts WHERE subscription_id = $1",
            CONTEXT_COLUMNS
        );
        let record = sqlx::query_as::<_, ContextRecord>(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        record.map(ProvisioningContext::try_from).transpose()
    }

    async fn list_contexts(&self) -> Result<Vec<ProvisioningContext>, CoreError> {
        let sql = format!(
            "SELECT {} FROM provisioning_contexts ORDER BY subscription_id",
            CONTEXT_COLUMNS
        );
        let records = sqlx::query_as::<_, ContextRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        records
            .into_iter()
            .map(ProvisioningContext::try_from)
            .collect()
    }

    async fn list_transitions(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<TransitionRecord>, CoreError> {
        let records = sqlx::query_as::<_, TransitionRecord>(
            r#"
            SELECT id, subscription_id, step_type, mode, status, state, generation,
                   resources::text AS resources, recorded_at
            FROM provisioning_transitions
            WHERE subscription_id = $1
            ORDER BY id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn enqueue_job(
        &self,
        job: &NewJob,
        delayed_until: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, CoreError> {
        let job_id = Uuid::new_v4().to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, dedup_key, job_type, status, payload, retry_count,
                 maximum_retries, delayed_until, created_at, updated_at)
            VALUES ($1, $2, $3, 'PENDING', $4, 0, $5, $6, NOW(), NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job_id)
        .bind(job.dedup_key())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.maximum_retries)
        .bind(delayed_until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(EnqueueOutcome::Created(job_id))
        } else {
            Ok(EnqueueOutcome::Deduplicated)
        }
    }

    async fn claim_jobs(
        &self,
        status: JobStatus,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, CoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT job_id FROM jobs
                WHERE status = $1
                  AND (delayed_until IS NULL OR delayed_until <= $2)
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'RUNNING', claim_id = $4, claimed_at = $2, heartbeat_at = $2,
                updated_at = $2
            FROM claimable
            WHERE jobs.job_id = claimable.job_id
              AND jobs.status = $1
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("jobs.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let records = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(status.as_str())
            .bind(now)
            .bind(limit)
            .bind(Uuid::new_v4().to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = decode_jobs(records)?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn complete_job(&self, job_id: &str, claim_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', claim_id = NULL, completed_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND status = 'RUNNING' AND claim_id = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_job_for_retry(
        &self,
        job_id: &str,
        claim_id: &str,
        retry_count: i32,
        delayed_until: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RETRYING', retry_count = $3, delayed_until = $4, error_message = $5,
                claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL, updated_at = NOW()
            WHERE job_id = $1 AND status = 'RUNNING' AND claim_id = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_id)
        .bind(retry_count)
        .bind(delayed_until)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn move_to_dead_letter(
        &self,
        job_id: &str,
        claim_id: &str,
        retry_count: i32,
        error_message: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'DEAD_LETTER', retry_count = $3, error_message = $4,
                claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL, updated_at = NOW()
            WHERE job_id = $1 AND status = 'RUNNING' AND claim_id = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_id)
        .bind(retry_count)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat_job(&self, job_id: &str, claim_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET heartbeat_at = NOW()
            WHERE job_id = $1 AND status = 'RUNNING' AND claim_id = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<StaleJobsOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        let dead_lettered = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'DEAD_LETTER',
                retry_count = LEAST(retry_count + 1, GREATEST(maximum_retries, 1)),
                error_message = $2, claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL,
                updated_at = NOW()
            WHERE status = 'RUNNING'
              AND COALESCE(heartbeat_at, claimed_at, updated_at) < $1
              AND retry_count + 1 >= maximum_retries
            "#,
        )
        .bind(older_than)
        .bind(STALE_CLAIM_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RETRYING', retry_count = retry_count + 1, delayed_until = NULL,
                error_message = $2, claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL,
                updated_at = NOW()
            WHERE status = 'RUNNING'
              AND COALESCE(heartbeat_at, claimed_at, updated_at) < $1
            "#,
        )
        .bind(older_than)
        .bind(STALE_CLAIM_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(StaleJobsOutcome {
            requeued,
            dead_lettered,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, CoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE job_id = $1", JOB_COLUMNS);
        let record = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        record.map(Job::try_from).transpose()
    }

    async fn count_jobs_by_status(&self, status: JobStatus) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn archive_completed_jobs(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<ArchiveOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT job_id FROM jobs
            WHERE status = 'COMPLETED' AND completed_at < $1
            ORDER BY completed_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(older_than)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.commit().await?;
            return Ok(ArchiveOutcome::default());
        }

        let archived = sqlx::query(
            r#"
            INSERT INTO job_archive
                (job_id, dedup_key, job_type, status, payload, retry_count,
                 maximum_retries, error_message, created_at, completed_at, archived_at)
            SELECT job_id, dedup_key, job_type, status, payload, retry_count,
                   maximum_retries, error_message, created_at, completed_at, NOW()
            FROM jobs
            WHERE job_id = ANY($1)
            "#,
        )
        .bind(&job_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let deleted = sqlx::query("DELETE FROM jobs WHERE job_id = ANY($1)")
            .bind(&job_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(ArchiveOutcome { archived, deleted })
    }

    async fn count_archived_jobs(&self) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_archive")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (name, locked_by, locked_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                locked_by = EXCLUDED.locked_by,
                locked_until = EXCLUDED.locked_until
            WHERE scheduler_locks.locked_until <= $4
               OR scheduler_locks.locked_by = EXCLUDED.locked_by
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM scheduler_locks WHERE name = $1 AND locked_by = $2")
                .bind(name)
                .bind(holder)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
