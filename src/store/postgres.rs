//! Postgres-backed [`JobStore`].

use super::{JobStore, StoreError};
use crate::data::models::{Execution, ExecutionId, Job, JobId, NewJob, TerminalUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict,
        other => StoreError::Transient(other.into()),
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE active")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    async fn insert_job(&self, new_job: &NewJob) -> Result<Job, StoreError> {
        new_job.validate().map_err(StoreError::Invalid)?;

        sqlx::query_as::<_, Job>(
            "INSERT INTO jobs (job_id, schedule, target_url, execution_type, active) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new_job.schedule)
        .bind(&new_job.target_url)
        .bind(new_job.execution_type)
        .bind(new_job.active)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError> {
        // executions cascade with the job
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_job_active(&self, job_id: JobId, active: bool) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE jobs SET active = $2, updated_at = NOW() WHERE job_id = $1")
                .bind(job_id)
                .bind(active)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_executions \
             (execution_id, job_id, scheduled_time, actual_start_time, finished_at, \
              status, http_status, duration_ms, attempt, error_message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (execution_id) DO NOTHING",
        )
        .bind(execution.id)
        .bind(execution.job_id)
        .bind(execution.scheduled_time)
        .bind(execution.actual_start_time)
        .bind(execution.finished_at)
        .bind(execution.status)
        .bind(execution.http_status)
        .bind(execution.duration_ms)
        .bind(execution.attempt)
        .bind(&execution.error_message)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn record_attempt_start(
        &self,
        execution_id: ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_executions \
             SET status = 'RUNNING', actual_start_time = $2 \
             WHERE execution_id = $1 AND status = 'PENDING'",
        )
        .bind(execution_id)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_execution_terminal(
        &self,
        execution_id: ExecutionId,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_executions \
             SET status = $2, http_status = $3, duration_ms = $4, finished_at = $5, \
                 error_message = $6 \
             WHERE execution_id = $1 AND status <> 'SUCCESS' AND status <> 'FAILED'",
        )
        .bind(execution_id)
        .bind(update.status)
        .bind(update.http_status)
        .bind(update.duration_ms)
        .bind(update.finished_at)
        .bind(&update.error_message)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_abandoned(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE job_executions \
             SET status = 'FAILED', finished_at = NOW(), error_message = 'abandoned' \
             WHERE (status = 'PENDING' OR status = 'RUNNING') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn list_executions(&self, job_id: JobId) -> Result<Vec<Execution>, StoreError> {
        sqlx::query_as::<_, Execution>(
            "SELECT * FROM job_executions WHERE job_id = $1 ORDER BY created_at ASC, attempt ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }
}
