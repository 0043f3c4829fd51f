//! Durable storage contract for jobs and execution records.
//!
//! The scheduler core only ever talks to [`JobStore`]; the Postgres
//! implementation supplies transactions and the in-memory one backs tests.

pub mod memory;
pub mod postgres;

use crate::data::models::{Execution, ExecutionId, Job, JobId, NewJob, TerminalUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("conflicting concurrent write")]
    Conflict,
    #[error("job definition rejected: {0}")]
    Invalid(#[source] anyhow::Error),
    /// Retryable I/O failure (connection loss, pool exhaustion, ...).
    #[error("transient store failure: {0}")]
    Transient(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Read/write capability set the scheduler core requires from durable
/// storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Snapshot of all jobs with `active = true`.
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Persist a new job after validating its schedule and target URL.
    async fn insert_job(&self, new_job: &NewJob) -> Result<Job, StoreError>;

    /// Delete a job; execution history goes with it.
    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError>;

    async fn set_job_active(&self, job_id: JobId, active: bool) -> Result<bool, StoreError>;

    /// Insert an execution row; a row that already exists under the same id
    /// is left untouched, making dispatch persistence idempotent.
    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Transition `PENDING -> RUNNING` and stamp the attempt start.
    /// Returns `false` if the row was not in `PENDING`.
    async fn record_attempt_start(
        &self,
        execution_id: ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Write the attempt's outcome, guarded by the row still being
    /// non-terminal. Returns whether the write took effect — terminal
    /// statuses are monotone and never rewritten.
    async fn update_execution_terminal(
        &self,
        execution_id: ExecutionId,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError>;

    /// Fail `PENDING`/`RUNNING` rows created before `cutoff`: leftovers of a
    /// previous run that died mid-flight. Returns the number swept.
    async fn sweep_abandoned(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Execution history for a job, oldest first.
    async fn list_executions(&self, job_id: JobId) -> Result<Vec<Execution>, StoreError>;
}

/// Delays between local retries of a failed store write.
const RETRY_DELAYS_MS: [u64; 3] = [100, 300, 900];

/// Run a store operation, retrying transient failures a bounded number of
/// times. Non-transient errors and exhaustion surface to the caller, who
/// degrades to logging — a missing execution row is an accepted failure
/// mode when the store is down.
pub async fn with_retry<T, Fut>(
    what: &'static str,
    mut op: impl FnMut() -> Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delays = RETRY_DELAYS_MS.iter();
    loop {
        match op().await {
            Err(error) if error.is_transient() => match delays.next() {
                Some(&ms) => {
                    warn!(what, error = %error, retry_in_ms = ms, "store write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                None => return Err(error),
            },
            other => return other,
        }
    }
}
