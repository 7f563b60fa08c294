//! Postgres-backed job store.
//!
//! Claims and sweeps lock candidate rows with `FOR UPDATE SKIP LOCKED`, so any
//! number of workers can run them concurrently without blocking each other or
//! handing the same row out twice. State transitions are computed by the
//! domain types in `listingsync-jobs` inside the locking transaction and then
//! written back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `InvalidState` |
//! | Database (check constraint violation) | `23514` | `InvalidState` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use listingsync_core::{BatchId, JobId, TaskId, TenantId};
use listingsync_events::TenantScope;
use listingsync_jobs::{
    Batch, BatchStatus, BatchTally, Job, JobKind, JobStatus, RetryPolicy, Task, TaskStatus,
};

use super::store::{ClaimFilter, JobStats, JobStore, StoreError, StoreResult};

/// Schema migrations for the job tables and the notification trigger.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending schema migrations.
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
}

/// Postgres job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, operation: &str) -> StoreResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn insert_job(&self, job: Job) -> StoreResult<Job> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        insert_job_row(&mut conn, &job).await?;
        Ok(job)
    }

    #[instrument(
        skip(self, batch, jobs),
        fields(batch_id = %batch.batch_id, job_count = jobs.len()),
        err
    )]
    async fn insert_batch(&self, batch: Batch, jobs: Vec<Job>) -> StoreResult<(Batch, Vec<Job>)> {
        let mut tx = self.begin("insert_batch").await?;

        sqlx::query(
            r#"
            INSERT INTO job_batches (
                id, batch_id, tenant_id, marketplace, action_code,
                total_count, completed_count, failed_count, cancelled_count,
                status, created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(batch.id)
        .bind(batch.batch_id.as_uuid())
        .bind(batch.tenant_id.as_uuid())
        .bind(batch.kind.marketplace.as_str())
        .bind(batch.kind.action.as_str())
        .bind(batch.total_count as i32)
        .bind(batch.completed_count as i32)
        .bind(batch.failed_count as i32)
        .bind(batch.cancelled_count as i32)
        .bind(batch.status.as_str())
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_batch", e))?;

        for job in &jobs {
            insert_job_row(&mut tx, job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_batch.commit", e))?;
        Ok((batch, jobs))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn get_batch(&self, batch_id: BatchId) -> StoreResult<Option<Batch>> {
        let row = sqlx::query("SELECT * FROM job_batches WHERE batch_id = $1")
            .bind(batch_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_batch", e))?;
        row.as_ref().map(decode_batch).transpose()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn list_batch_jobs(&self, batch_id: BatchId) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE batch_id = $1 ORDER BY created_at, id")
            .bind(batch_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batch_jobs", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(level = "debug", skip(self, filter), fields(scope = %filter.scope), err)]
    async fn claim_next_job(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let mut tx = self.begin("claim_next_job").await?;

        let excluded: Vec<Uuid> = filter
            .exclude_tenants
            .iter()
            .map(|t| *t.as_uuid())
            .collect();
        let marketplaces: Option<Vec<String>> = filter
            .marketplaces
            .as_ref()
            .map(|m| m.iter().map(|m| m.as_str().to_string()).collect());

        let row = sqlx::query(
            r#"
            SELECT j.*
            FROM jobs j
            WHERE j.status = 'PENDING'
              AND j.expires_at > $1
              AND ($2::uuid IS NULL OR j.tenant_id = $2)
              AND NOT (j.tenant_id = ANY($3))
              AND ($4::text[] IS NULL OR j.marketplace = ANY($4))
              AND NOT EXISTS (
                  SELECT 1 FROM job_batches b
                  WHERE b.batch_id = j.batch_id AND b.status = 'CANCELLED'
              )
            ORDER BY j.priority ASC, j.created_at ASC
            LIMIT 1
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(filter.scope.tenant().map(|t| *t.as_uuid()))
        .bind(&excluded)
        .bind(marketplaces)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next_job", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("claim_next_job.commit", e))?;
            return Ok(None);
        };

        let mut job = decode_job(&row)?;
        job.claim(Uuid::new_v4(), now)?;
        save_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next_job.commit", e))?;
        Ok(Some(job))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn expire_pending_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let mut tx = self.begin("expire_pending_jobs").await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'PENDING' AND expires_at <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("expire_pending_jobs", e))?;

        let mut expired = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode_job(row)?;
            job.expire(now)?;
            save_job(&mut tx, &job).await?;
            expired.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("expire_pending_jobs.commit", e))?;
        Ok(expired)
    }

    #[instrument(level = "debug", skip(self, error, policy), err)]
    async fn sweep_stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        let mut tx = self.begin("sweep_stale_jobs").await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'RUNNING' AND claimed_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("sweep_stale_jobs", e))?;

        let mut swept = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode_job(row)?;
            job.record_failure(error, true, policy, now)?;
            if batch_cancelled(&mut tx, &job).await? {
                job.abandon_retry(now);
            }
            save_job(&mut tx, &job).await?;
            swept.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("sweep_stale_jobs.commit", e))?;
        Ok(swept)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn release_due_retries(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PENDING', retry_at = NULL, updated_at = $1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'RETRY_PENDING' AND (retry_at IS NULL OR retry_at <= $1)
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_due_retries", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn finish_job(&self, job: &mut Job, claim_id: Uuid) -> StoreResult<bool> {
        let mut tx = self.begin("finish_job").await?;

        let held = sqlx::query(
            "SELECT id FROM jobs WHERE id = $1 AND status = 'RUNNING' AND claim_id = $2 FOR UPDATE",
        )
        .bind(job.id.as_uuid())
        .bind(claim_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finish_job", e))?;
        if held.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("finish_job.rollback", e))?;
            return Ok(false);
        }

        if batch_cancelled(&mut tx, job).await? {
            job.abandon_retry(job.updated_at);
        }
        save_job(&mut tx, job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("finish_job.commit", e))?;
        Ok(true)
    }

    #[instrument(skip(self, reason), fields(job_id = %job_id), err)]
    async fn cancel_job(&self, job_id: JobId, reason: &str, now: DateTime<Utc>) -> StoreResult<Job> {
        let mut tx = self.begin("cancel_job").await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_job", e))?
            .ok_or(StoreError::JobNotFound(job_id))?;

        let mut job = decode_job(&row)?;
        job.cancel(reason, now)?;
        save_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("cancel_job.commit", e))?;
        Ok(job)
    }

    #[instrument(skip(self, reason), fields(scope = %scope), err)]
    async fn cancel_unclaimed_jobs(
        &self,
        scope: TenantScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        let mut tx = self.begin("cancel_unclaimed_jobs").await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('PENDING', 'RETRY_PENDING')
              AND ($1::uuid IS NULL OR tenant_id = $1)
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(scope.tenant().map(|t| *t.as_uuid()))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_unclaimed_jobs", e))?;

        let mut cancelled = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode_job(row)?;
            job.cancel(reason, now)?;
            save_job(&mut tx, &job).await?;
            cancelled.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("cancel_unclaimed_jobs.commit", e))?;
        Ok(cancelled)
    }

    #[instrument(skip(self, tasks), fields(job_id = %job_id, task_count = tasks.len()), err)]
    async fn create_tasks(&self, job_id: JobId, tasks: Vec<Task>) -> StoreResult<Vec<Task>> {
        let mut tx = self.begin("create_tasks").await?;

        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO job_tasks (
                    id, job_id, position, description, status,
                    started_at, completed_at, result, error_message
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (job_id, position) DO NOTHING
                "#,
            )
            .bind(task.id.as_uuid())
            .bind(job_id.as_uuid())
            .bind(task.position as i32)
            .bind(&task.description)
            .bind(task.status.as_str())
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(&task.result)
            .bind(&task.error_message)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_tasks", e))?;
        }

        let persisted = fetch_tasks(&mut tx, job_id).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_tasks.commit", e))?;
        Ok(persisted)
    }

    #[instrument(level = "debug", skip(self), fields(job_id = %job_id), err)]
    async fn list_tasks(&self, job_id: JobId) -> StoreResult<Vec<Task>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("list_tasks", e))?;
        fetch_tasks(&mut conn, job_id).await
    }

    #[instrument(
        level = "debug",
        skip(self, task),
        fields(job_id = %task.job_id, position = task.position, status = %task.status),
        err
    )]
    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_tasks
            SET status = $2, started_at = $3, completed_at = $4, result = $5, error_message = $6
            WHERE id = $1
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.result)
        .bind(&task.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_task", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidState(format!("task {} not found", task.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn mark_batch_started(&self, batch_id: BatchId, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_batches
            SET status = 'RUNNING', started_at = $2, updated_at = $2
            WHERE batch_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(batch_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_batch_started", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn recompute_batch(&self, batch_id: BatchId, now: DateTime<Utc>) -> StoreResult<Batch> {
        let mut tx = self.begin("recompute_batch").await?;

        let mut batch = lock_batch(&mut tx, batch_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::BIGINT AS n
            FROM jobs
            WHERE batch_id = $1
            GROUP BY status
            "#,
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recompute_batch", e))?;

        let mut tally = BatchTally::default();
        for row in &rows {
            let (status, n) = decode_status_count(row)?;
            let n = n as u32;
            match status {
                JobStatus::Success => tally.succeeded += n,
                JobStatus::Failed => tally.failed += n,
                JobStatus::Cancelled => tally.cancelled += n,
                _ => {}
            }
        }

        batch.apply_tally(tally, now);
        save_batch(&mut tx, &batch).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("recompute_batch.commit", e))?;
        Ok(batch)
    }

    #[instrument(skip(self, reason), fields(batch_id = %batch_id), err)]
    async fn cancel_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Batch, Vec<Job>)> {
        let mut tx = self.begin("cancel_batch").await?;

        let mut batch = lock_batch(&mut tx, batch_id).await?;
        batch.cancel(now)?;
        save_batch(&mut tx, &batch).await?;

        // Wait on rows a concurrent claim holds; once it commits they are
        // RUNNING and drop out of the WHERE clause.
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE batch_id = $1 AND status IN ('PENDING', 'RETRY_PENDING')
            FOR UPDATE
            "#,
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_batch", e))?;

        let mut cancelled = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode_job(row)?;
            job.cancel(reason, now)?;
            save_job(&mut tx, &job).await?;
            cancelled.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("cancel_batch.commit", e))?;
        Ok((batch, cancelled))
    }

    #[instrument(level = "debug", skip(self), fields(scope = %scope), err)]
    async fn stats(&self, scope: TenantScope) -> StoreResult<JobStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::BIGINT AS n
            FROM jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY status
            "#,
        )
        .bind(scope.tenant().map(|t| *t.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in &rows {
            let (status, n) = decode_status_count(row)?;
            stats.record(status, n.max(0) as u64);
        }
        Ok(stats)
    }
}

async fn insert_job_row(conn: &mut PgConnection, job: &Job) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, tenant_id, marketplace, action_code, product_id, batch_id,
            priority, status, retry_count, max_retries, input_data, result_data,
            error_message, claim_id, created_at, updated_at, expires_at,
            started_at, claimed_at, completed_at, retry_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.tenant_id.as_uuid())
    .bind(job.kind.marketplace.as_str())
    .bind(job.kind.action.as_str())
    .bind(&job.product_id)
    .bind(job.batch_id.map(|b| *b.as_uuid()))
    .bind(job.priority)
    .bind(job.status.as_str())
    .bind(job.retry_count as i32)
    .bind(job.max_retries as i32)
    .bind(&job.input_data)
    .bind(&job.result_data)
    .bind(&job.error_message)
    .bind(job.claim_id)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.expires_at)
    .bind(job.started_at)
    .bind(job.claimed_at)
    .bind(job.completed_at)
    .bind(job.retry_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

/// Write back every column a lifecycle transition may touch.
async fn save_job(conn: &mut PgConnection, job: &Job) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            retry_count = $3,
            result_data = $4,
            error_message = $5,
            claim_id = $6,
            updated_at = $7,
            started_at = $8,
            claimed_at = $9,
            completed_at = $10,
            retry_at = $11
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.retry_count as i32)
    .bind(&job.result_data)
    .bind(&job.error_message)
    .bind(job.claim_id)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.claimed_at)
    .bind(job.completed_at)
    .bind(job.retry_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_job", e))?;
    Ok(())
}

/// Whether a RETRY_PENDING `job` belongs to a CANCELLED batch.
///
/// Share-locks the batch row so a concurrent `cancel_batch` either sees the
/// requeue or is seen by it.
async fn batch_cancelled(conn: &mut PgConnection, job: &Job) -> StoreResult<bool> {
    let Some(batch_id) = job.batch_id.filter(|_| job.status == JobStatus::RetryPending) else {
        return Ok(false);
    };
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM job_batches WHERE batch_id = $1 FOR SHARE")
            .bind(batch_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("batch_cancelled", e))?;
    Ok(status.as_deref() == Some(BatchStatus::Cancelled.as_str()))
}

async fn lock_batch(conn: &mut PgConnection, batch_id: BatchId) -> StoreResult<Batch> {
    let row = sqlx::query("SELECT * FROM job_batches WHERE batch_id = $1 FOR UPDATE")
        .bind(batch_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_batch", e))?
        .ok_or(StoreError::BatchNotFound(batch_id))?;
    decode_batch(&row)
}

async fn save_batch(conn: &mut PgConnection, batch: &Batch) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE job_batches
        SET completed_count = $2,
            failed_count = $3,
            cancelled_count = $4,
            status = $5,
            updated_at = $6,
            started_at = $7,
            completed_at = $8
        WHERE batch_id = $1
        "#,
    )
    .bind(batch.batch_id.as_uuid())
    .bind(batch.completed_count as i32)
    .bind(batch.failed_count as i32)
    .bind(batch.cancelled_count as i32)
    .bind(batch.status.as_str())
    .bind(batch.updated_at)
    .bind(batch.started_at)
    .bind(batch.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_batch", e))?;
    Ok(())
}

async fn fetch_tasks(conn: &mut PgConnection, job_id: JobId) -> StoreResult<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM job_tasks WHERE job_id = $1 ORDER BY position ASC")
        .bind(job_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;
    rows.iter().map(decode_task).collect()
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") => StoreError::InvalidState(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn corrupt(what: &str, id: Uuid, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("corrupt {} row {}: {}", what, id, err))
}

fn decode_status_count(row: &PgRow) -> StoreResult<(JobStatus, i64)> {
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("decode_status_count", e))?;
    let n: i64 = row
        .try_get("n")
        .map_err(|e| map_sqlx_error("decode_status_count", e))?;
    let status = status
        .parse()
        .map_err(|e| StoreError::Storage(format!("corrupt job status: {e}")))?;
    Ok((status, n))
}

/// Internal row representation for the `jobs` table.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    tenant_id: Uuid,
    marketplace: String,
    action_code: String,
    product_id: String,
    batch_id: Option<Uuid>,
    priority: i32,
    status: String,
    retry_count: i32,
    max_retries: i32,
    input_data: serde_json::Value,
    result_data: Option<serde_json::Value>,
    error_message: Option<String>,
    claim_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            marketplace: row.try_get("marketplace")?,
            action_code: row.try_get("action_code")?,
            product_id: row.try_get("product_id")?,
            batch_id: row.try_get("batch_id")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            input_data: row.try_get("input_data")?,
            result_data: row.try_get("result_data")?,
            error_message: row.try_get("error_message")?,
            claim_id: row.try_get("claim_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
            started_at: row.try_get("started_at")?,
            claimed_at: row.try_get("claimed_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_at: row.try_get("retry_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = JobKind::new(
            row.marketplace.parse().map_err(|e| corrupt("job", row.id, e))?,
            row.action_code.parse().map_err(|e| corrupt("job", row.id, e))?,
        );
        let status: JobStatus = row.status.parse().map_err(|e| corrupt("job", row.id, e))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind,
            product_id: row.product_id,
            batch_id: row.batch_id.map(BatchId::from_uuid),
            priority: row.priority,
            status,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            input_data: row.input_data,
            result_data: row.result_data,
            error_message: row.error_message,
            claim_id: row.claim_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            started_at: row.started_at,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            retry_at: row.retry_at,
        })
    }
}

fn decode_job(row: &PgRow) -> StoreResult<Job> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}

/// Internal row representation for the `job_tasks` table.
#[derive(Debug)]
struct TaskRow {
    id: Uuid,
    job_id: Uuid,
    position: i32,
    description: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            position: row.try_get("position")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status: TaskStatus = row.status.parse().map_err(|e| corrupt("task", row.id, e))?;
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            position: row.position.max(1) as u32,
            description: row.description,
            status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result,
            error_message: row.error_message,
        })
    }
}

fn decode_task(row: &PgRow) -> StoreResult<Task> {
    TaskRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_task", e))?
        .try_into()
}

/// Internal row representation for the `job_batches` table.
#[derive(Debug)]
struct BatchRow {
    id: Uuid,
    batch_id: Uuid,
    tenant_id: Uuid,
    marketplace: String,
    action_code: String,
    total_count: i32,
    completed_count: i32,
    failed_count: i32,
    cancelled_count: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for BatchRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            tenant_id: row.try_get("tenant_id")?,
            marketplace: row.try_get("marketplace")?,
            action_code: row.try_get("action_code")?,
            total_count: row.try_get("total_count")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
            cancelled_count: row.try_get("cancelled_count")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<BatchRow> for Batch {
    type Error = StoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        let kind = JobKind::new(
            row.marketplace.parse().map_err(|e| corrupt("batch", row.id, e))?,
            row.action_code.parse().map_err(|e| corrupt("batch", row.id, e))?,
        );
        let status: BatchStatus = row.status.parse().map_err(|e| corrupt("batch", row.id, e))?;
        Ok(Batch {
            id: row.id,
            batch_id: BatchId::from_uuid(row.batch_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind,
            total_count: row.total_count.max(0) as u32,
            completed_count: row.completed_count.max(0) as u32,
            failed_count: row.failed_count.max(0) as u32,
            cancelled_count: row.cancelled_count.max(0) as u32,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn decode_batch(row: &PgRow) -> StoreResult<Batch> {
    BatchRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_batch", e))?
        .try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_maps_to_storage() {
        let err = map_sqlx_error("claim_next_job", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Storage(msg) if msg.contains("claim_next_job")));
    }

    #[test]
    fn row_not_found_maps_to_storage() {
        let err = map_sqlx_error("get_job", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Storage(_)));
    }
}
