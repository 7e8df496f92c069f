// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::context::ProvisioningContext;
use crate::error::CoreError;
use crate::job::{ArchiveOutcome, EnqueueOutcome, Job, JobStatus, NewJob, StaleJobsOutcome};

use super::{
    ContextRecord, EncodedContext, JOB_COLUMNS, JobRecord, Persistence, STALE_CLAIM_MESSAGE,
    TransitionRecord, decode_jobs,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const CONTEXT_COLUMNS: &str = "subscription_id, step_type, mode, status, state, generation, spec, \
     current_resources, new_resources, created_at, updated_at, version";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/hearth.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn save_context(
        &self,
        context: &ProvisioningContext,
    ) -> Result<ProvisioningContext, CoreError> {
        let row = EncodedContext::encode(context)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let written = if row.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO provisioning_contexts
                    (subscription_id, step_type, mode, status, state, generation, spec,
                     current_resources, new_resources, created_at, updated_at, version)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
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
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE provisioning_contexts
                SET step_type = ?, mode = ?, status = ?, state = ?, generation = ?, spec = ?,
                    current_resources = ?, new_resources = ?, updated_at = ?,
                    version = version + 1
                WHERE subscription_id = ? AND version = ?
                "#,
            )
            .bind(row.step_type)
            .bind(row.mode)
            .bind(row.status)
            .bind(row.state)
            .bind(row.generation)
            .bind(&row.spec)
            .bind(&row.current)
            .bind(&row.new)
            .bind(now)
            .bind(row.subscription_id)
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
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.subscription_id)
        .bind(row.step_type)
        .bind(row.mode)
        .bind(row.status)
        .bind(row.state)
        .bind(row.generation)
        .bind(&row.snapshot)
        .bind(now)
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
            "SELECT {} FROM provisioning_contexts WHERE subscription_id = ?",
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
                   resources, recorded_at
            FROM provisioning_transitions
            WHERE subscription_id = ?
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
        let now = Utc::now();

        // The partial unique index on active dedup keys makes this atomic.
        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, dedup_key, job_type, status, payload, retry_count,
                 maximum_retries, delayed_until, created_at, updated_at)
            VALUES (?, ?, ?, 'PENDING', ?, 0, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job_id)
        .bind(job.dedup_key())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.maximum_retries)
        .bind(delayed_until)
        .bind(now)
        .bind(now)
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

        // Compare-and-set: the outer status predicate is re-checked against the
        // row being updated, so a row taken by a concurrent claim is skipped.
        let claim_id = Uuid::new_v4().to_string();
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'RUNNING', claim_id = ?, claimed_at = ?, heartbeat_at = ?, updated_at = ?
            WHERE status = ?
              AND job_id IN (
                  SELECT job_id FROM jobs
                  WHERE status = ?
                    AND (delayed_until IS NULL OR delayed_until <= ?)
                  ORDER BY created_at
                  LIMIT ?
              )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let records = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(&claim_id)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(status.as_str())
            .bind(status.as_str())
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = decode_jobs(records)?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn complete_job(&self, job_id: &str, claim_id: &str) -> Result<bool, CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', claim_id = NULL, completed_at = ?, updated_at = ?
            WHERE job_id = ? AND status = 'RUNNING' AND claim_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
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
            SET status = 'RETRYING', retry_count = ?, delayed_until = ?, error_message = ?,
                claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE job_id = ? AND status = 'RUNNING' AND claim_id = ?
            "#,
        )
        .bind(retry_count)
        .bind(delayed_until)
        .bind(error_message)
        .bind(Utc::now())
        .bind(job_id)
        .bind(claim_id)
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
            SET status = 'DEAD_LETTER', retry_count = ?, error_message = ?,
                claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE job_id = ? AND status = 'RUNNING' AND claim_id = ?
            "#,
        )
        .bind(retry_count)
        .bind(error_message)
        .bind(Utc::now())
        .bind(job_id)
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat_job(&self, job_id: &str, claim_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET heartbeat_at = ?
            WHERE job_id = ? AND status = 'RUNNING' AND claim_id = ?
            "#,
        )
        .bind(Utc::now())
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
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let dead_lettered = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'DEAD_LETTER', retry_count = MIN(retry_count + 1, MAX(maximum_retries, 1)),
                error_message = ?, claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL,
                updated_at = ?
            WHERE status = 'RUNNING'
              AND COALESCE(heartbeat_at, claimed_at, updated_at) < ?
              AND retry_count + 1 >= maximum_retries
            "#,
        )
        .bind(STALE_CLAIM_MESSAGE)
        .bind(now)
        .bind(older_than)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RETRYING', retry_count = retry_count + 1, delayed_until = NULL,
                error_message = ?, claim_id = NULL, claimed_at = NULL, heartbeat_at = NULL,
                updated_at = ?
            WHERE status = 'RUNNING'
              AND COALESCE(heartbeat_at, claimed_at, updated_at) < ?
            "#,
        )
        .bind(STALE_CLAIM_MESSAGE)
        .bind(now)
        .bind(older_than)
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
        let sql = format!("SELECT {} FROM jobs WHERE job_id = ?", JOB_COLUMNS);
        let record = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        record.map(Job::try_from).transpose()
    }

    async fn count_jobs_by_status(&self, status: JobStatus) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
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
            WHERE status = 'COMPLETED' AND completed_at < ?
            ORDER BY completed_at
            LIMIT ?
            "#,
        )
        .bind(older_than)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let archived_at = Utc::now();
        let mut outcome = ArchiveOutcome::default();

        for job_id in &job_ids {
            outcome.archived += sqlx::query(
                r#"
                INSERT INTO job_archive
                    (job_id, dedup_key, job_type, status, payload, retry_count,
                     maximum_retries, error_message, created_at, completed_at, archived_at)
                SELECT job_id, dedup_key, job_type, status, payload, retry_count,
                       maximum_retries, error_message, created_at, completed_at, ?
                FROM jobs
                WHERE job_id = ?
                "#,
            )
            .bind(archived_at)
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            outcome.deleted += sqlx::query("DELETE FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(outcome)
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
            VALUES (?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                locked_by = excluded.locked_by,
                locked_until = excluded.locked_until
            WHERE scheduler_locks.locked_until <= ?
               OR scheduler_locks.locked_by = excluded.locked_by
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
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE name = ? AND locked_by = ?")
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
