//! In-memory [`JobStore`] for tests and local experimentation.
//!
//! Mirrors the Postgres implementation's semantics — idempotent execution
//! upsert, terminal-status guard, cascade delete — without the database.

use super::{JobStore, StoreError};
use crate::data::models::{
    Execution, ExecutionId, ExecutionStatus, Job, JobId, NewJob, TerminalUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    executions: HashMap<ExecutionId, Execution>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.values().filter(|j| j.active).cloned().collect())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().unwrap().jobs.get(&job_id).cloned())
    }

    async fn insert_job(&self, new_job: &NewJob) -> Result<Job, StoreError> {
        new_job.validate().map_err(StoreError::Invalid)?;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            schedule: new_job.schedule.clone(),
            target_url: new_job.target_url.clone(),
            execution_type: new_job.execution_type,
            active: new_job.active,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.jobs.remove(&job_id).is_some();
        if removed {
            inner.executions.retain(|_, e| e.job_id != job_id);
        }
        Ok(removed)
    }

    async fn set_job_active(&self, job_id: JobId, active: bool) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(&job_id) {
            Some(job) => {
                job.active = active;
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .executions
            .entry(execution.id)
            .or_insert_with(|| execution.clone());
        Ok(())
    }

    async fn record_attempt_start(
        &self,
        execution_id: ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.executions.get_mut(&execution_id) {
            Some(row) if row.status == ExecutionStatus::Pending => {
                row.status = ExecutionStatus::Running;
                row.actual_start_time = Some(started_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }

    async fn update_execution_terminal(
        &self,
        execution_id: ExecutionId,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.executions.get_mut(&execution_id) {
            Some(row) if !row.status.is_terminal() => {
                row.status = update.status;
                row.http_status = update.http_status;
                row.duration_ms = update.duration_ms;
                row.finished_at = Some(update.finished_at);
                row.error_message = update.error_message.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }

    async fn sweep_abandoned(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut swept = 0;
        for row in inner.executions.values_mut() {
            let stale = matches!(
                row.status,
                ExecutionStatus::Pending | ExecutionStatus::Running
            ) && row.created_at < cutoff;
            if stale {
                row.status = ExecutionStatus::Failed;
                row.finished_at = Some(Utc::now());
                row.error_message = Some("abandoned".to_string());
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn list_executions(&self, job_id: JobId) -> Result<Vec<Execution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.created_at, e.attempt));
        Ok(rows)
    }
}
