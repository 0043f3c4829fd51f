//! Database models for jobs and their execution records.

use crate::cron::Schedule;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;
pub type ExecutionId = Uuid;

/// Delivery semantics for a job's occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Failed attempts are retried up to `max_retries` additional times.
    AtLeastOnce,
    /// A single attempt per occurrence, whatever its outcome.
    AtMostOnce,
}

/// Lifecycle state of one execution attempt.
///
/// `Success` and `Failed` are terminal and never rewritten. `Retrying` is
/// terminal for its attempt; the follow-up attempt gets a fresh row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

/// A scheduled callback job as stored in the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    #[sqlx(rename = "job_id")]
    pub id: JobId,
    /// Six-field CRON expression (`S M H DoM Mo DoW`), evaluated in UTC.
    pub schedule: String,
    pub target_url: String,
    pub execution_type: ExecutionType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job definition as supplied by the CRUD surface, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub schedule: String,
    pub target_url: String,
    pub execution_type: ExecutionType,
    pub active: bool,
}

impl NewJob {
    /// Validate the CRON expression and target URL.
    ///
    /// Rejects expressions that do not parse, expressions with no future
    /// occurrence, and non-HTTP(S) target URLs. Jobs failing validation are
    /// never persisted, so the scheduler never sees them.
    pub fn validate(&self) -> Result<()> {
        let schedule = Schedule::parse(&self.schedule)?;
        schedule.next_after(Utc::now())?;

        let url = url::Url::parse(&self.target_url)?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "target_url must be an absolute http(s) URL, got scheme `{}`",
            url.scheme()
        );
        Ok(())
    }
}

/// One attempt at delivering one occurrence of a job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Execution {
    #[sqlx(rename = "execution_id")]
    pub id: ExecutionId,
    pub job_id: JobId,
    /// The instant the first attempt of this occurrence was due
    /// (`origin_scheduled_for`), shared by every retry row of the occurrence.
    pub scheduled_time: DateTime<Utc>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub http_status: Option<i32>,
    pub duration_ms: Option<i64>,
    /// 1-based attempt counter within the occurrence.
    pub attempt: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Lateness of the attempt relative to its scheduled instant.
    ///
    /// Derived, never stored; `None` until the attempt has started.
    pub fn drift(&self) -> Option<chrono::Duration> {
        self.actual_start_time
            .map(|started| started - self.scheduled_time)
    }
}

/// Terminal (or attempt-terminal) outcome written onto an execution row.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: ExecutionStatus,
    pub http_status: Option<i32>,
    pub duration_ms: Option<i64>,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}
