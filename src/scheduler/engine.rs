//! The scheduler's single-owner control loop.
//!
//! Exactly one engine task owns the queue, the active-job map, and every
//! execution-state write. Workers run in parallel but only talk back over
//! the outcome channel; nothing else mutates scheduling state.

use crate::cron::Schedule;
use crate::data::models::{
    Execution, ExecutionId, ExecutionStatus, ExecutionType, Job, JobId, TerminalUpdate,
};
use crate::error::Result;
use crate::scheduler::backoff;
use crate::scheduler::pool::{AttemptOutcome, Saturated, Task, WorkerPool};
use crate::scheduler::queue::{DueQueue, QueueEntry};
use crate::scheduler::{Control, SchedulerConfig};
use crate::store::{self, JobStore};
use anyhow::bail;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a drain-mode shutdown waits for in-flight attempts.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Re-plan delay when the worker pool refuses a submission.
const SATURATION_DELAY_MS: i64 = 100;

/// A job the scheduler currently tracks, with its parsed schedule.
struct ActiveJob {
    job: Job,
    schedule: Schedule,
}

pub(crate) struct Engine {
    store: Arc<dyn JobStore>,
    queue: Arc<DueQueue>,
    pool: WorkerPool,
    outcome_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
    control_rx: mpsc::Receiver<Control>,
    config: SchedulerConfig,
    jobs: HashMap<JobId, ActiveJob>,
    /// Dispatched attempts whose outcome has not come back yet.
    in_flight: HashMap<ExecutionId, QueueEntry>,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<DueQueue>,
        pool: WorkerPool,
        outcome_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
        control_rx: mpsc::Receiver<Control>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            outcome_rx,
            control_rx,
            config,
            jobs: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        info!("scheduler loop started");
        self.refresh().await;
        let mut next_refresh = time::Instant::now() + self.config.refresh_interval;

        loop {
            let queue = self.queue.clone();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep_until(next_refresh) => {
                    let interval = if self.refresh().await {
                        self.config.refresh_interval
                    } else {
                        // Accelerated retry after a failed reconciliation.
                        self.config.refresh_interval / 2
                    };
                    next_refresh = time::Instant::now() + interval;
                }
                Some(control) = self.control_rx.recv() => self.handle_control(control).await,
                Some(outcome) = self.outcome_rx.recv() => self.finish_attempt(outcome, false).await,
                _ = queue.wait_until_due() => self.dispatch_due().await,
            }
        }

        info!(in_flight = self.in_flight.len(), "scheduler loop stopping");
        self.pool
            .shutdown(self.config.drain_on_shutdown, DRAIN_DEADLINE)
            .await;
        // Record whatever the workers managed to finish (or had cancelled).
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.finish_attempt(outcome, true).await;
        }
        info!("scheduler loop stopped");
    }

    /// Reconcile the in-memory job set and queue with the store.
    ///
    /// Returns `false` when the store could not be read, in which case the
    /// previous snapshot stays in effect.
    async fn refresh(&mut self) -> bool {
        let now = Utc::now();
        let jobs = match self.store.list_active_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(error = %error, "job refresh failed, keeping previous snapshot");
                return false;
            }
        };

        let mut seen: HashSet<JobId> = HashSet::with_capacity(jobs.len());
        let mut added = 0usize;
        let mut rescheduled = 0usize;
        for job in jobs {
            seen.insert(job.id);
            if let Some(tracked) = self.jobs.get_mut(&job.id) {
                if tracked.job.schedule == job.schedule {
                    // Unchanged cadence keeps its queue entry; pick up URL or
                    // delivery-semantics edits for future dispatches.
                    tracked.job = job;
                    continue;
                }
                self.queue.remove(job.id);
                self.jobs.remove(&job.id);
                if self.track_job(job, now) {
                    rescheduled += 1;
                }
            } else if self.track_job(job, now) {
                added += 1;
            }
        }

        let stale: Vec<JobId> = self
            .jobs
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();
        for job_id in &stale {
            self.queue.remove(*job_id);
            self.jobs.remove(job_id);
        }

        info!(
            active = self.jobs.len(),
            added,
            rescheduled,
            removed = stale.len(),
            queued = self.queue.len(),
            "job refresh complete"
        );
        true
    }

    /// Parse and enqueue a job from `now`. Jobs whose schedule does not
    /// parse or has no future occurrence are skipped and never enqueued.
    fn track_job(&mut self, job: Job, now: DateTime<Utc>) -> bool {
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(error) => {
                warn!(job_id = %job.id, schedule = %job.schedule, error = %error,
                    "job has an invalid schedule, skipping");
                return false;
            }
        };
        let next = match schedule.next_after(now) {
            Ok(next) => next,
            Err(error) => {
                warn!(job_id = %job.id, schedule = %job.schedule, error = %error,
                    "job is unschedulable, skipping");
                return false;
            }
        };

        debug!(job_id = %job.id, next = %next, "job scheduled");
        self.queue.push(QueueEntry::occurrence(job.id, next));
        self.jobs.insert(job.id, ActiveJob { job, schedule });
        true
    }

    /// Drain every entry that has come due and hand each to the pool.
    async fn dispatch_due(&mut self) {
        loop {
            let now = Utc::now();
            let Some(entry) = self.queue.pop_if_due(now) else {
                break;
            };
            self.dispatch(entry, now).await;
        }
    }

    async fn dispatch(&mut self, entry: QueueEntry, now: DateTime<Utc>) {
        let Some(active) = self.jobs.get(&entry.job_id) else {
            debug!(job_id = %entry.job_id, "dropping entry for a job no longer scheduled");
            return;
        };
        let target_url = active.job.target_url.clone();

        // Refused submissions get re-planned without an execution row.
        if !self.pool.has_capacity() {
            debug!(job_id = %entry.job_id, "worker pool saturated, deferring dispatch");
            let mut deferred = entry;
            deferred.scheduled_for = now + chrono::Duration::milliseconds(SATURATION_DELAY_MS);
            self.queue.push(deferred);
            return;
        }

        let execution_id = entry.execution_id.unwrap_or_else(Uuid::new_v4);
        let execution = Execution {
            id: execution_id,
            job_id: entry.job_id,
            scheduled_time: entry.origin_scheduled_for,
            actual_start_time: None,
            finished_at: None,
            status: ExecutionStatus::Pending,
            http_status: None,
            duration_ms: None,
            attempt: entry.attempt as i32,
            error_message: None,
            created_at: now,
        };
        // PENDING lands before the task is submitted; a crash between the
        // two leaves a sweepable row instead of an invisible attempt.
        if let Err(error) = store::with_retry("persist pending execution", || {
            self.store.upsert_execution(&execution)
        })
        .await
        {
            warn!(execution_id = %execution_id, error = %error,
                "could not persist pending execution, dispatching anyway");
        }

        let task = Task {
            execution_id,
            job_id: entry.job_id,
            target_url,
            attempt: entry.attempt,
            scheduled_for: entry.scheduled_for,
            timeout: self.config.request_timeout,
        };
        match self.pool.submit(task) {
            Ok(()) => {
                debug!(
                    job_id = %entry.job_id,
                    execution_id = %execution_id,
                    attempt = entry.attempt,
                    scheduled_for = %entry.scheduled_for,
                    "attempt dispatched"
                );
                self.in_flight.insert(execution_id, entry);
            }
            Err(Saturated(_)) => {
                // Lost the race with the backlog filling up; the PENDING row
                // already exists, so the retry entry keeps its id.
                let mut deferred = entry;
                deferred.execution_id = Some(execution_id);
                deferred.scheduled_for = now + chrono::Duration::milliseconds(SATURATION_DELAY_MS);
                self.queue.push(deferred);
            }
        }
    }

    /// Apply an attempt's outcome: record it, then either retry the
    /// occurrence or plan the next one.
    async fn finish_attempt(&mut self, attempt: AttemptOutcome, shutting_down: bool) {
        let Some(entry) = self.in_flight.remove(&attempt.execution_id) else {
            warn!(execution_id = %attempt.execution_id, "outcome for an unknown execution");
            return;
        };
        let outcome = attempt.outcome;
        let finished_at = attempt.finished_at;

        let may_retry = self
            .jobs
            .get(&entry.job_id)
            .map(|active| active.job.execution_type == ExecutionType::AtLeastOnce)
            .unwrap_or(false)
            && entry.attempt <= self.config.max_retries;
        let retrying = !outcome.success && may_retry && !shutting_down;

        let status = if outcome.success {
            ExecutionStatus::Success
        } else if retrying {
            ExecutionStatus::Retrying
        } else {
            ExecutionStatus::Failed
        };

        let update = TerminalUpdate {
            status,
            http_status: outcome.http_status,
            duration_ms: Some(outcome.duration_ms),
            finished_at,
            error_message: outcome.error_message,
        };
        match store::with_retry("record attempt outcome", || {
            self.store
                .update_execution_terminal(attempt.execution_id, &update)
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(execution_id = %attempt.execution_id,
                    "outcome write skipped, row already terminal");
            }
            Err(error) => {
                // Degrade to logging; the row stays behind as PENDING/RUNNING
                // for the next startup sweep.
                warn!(execution_id = %attempt.execution_id, error = %error,
                    "could not record attempt outcome");
            }
        }

        if shutting_down {
            return;
        }

        if retrying {
            let delay = backoff::retry_delay(entry.attempt, self.config.backoff_cap);
            debug!(
                job_id = %entry.job_id,
                next_attempt = entry.attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retry planned"
            );
            self.queue.push(QueueEntry {
                job_id: entry.job_id,
                scheduled_for: finished_at
                    + chrono::Duration::from_std(delay).unwrap_or_default(),
                attempt: entry.attempt + 1,
                origin_scheduled_for: entry.origin_scheduled_for,
                execution_id: None,
            });
        } else {
            self.schedule_next(entry.job_id, entry.origin_scheduled_for, finished_at);
        }
    }

    /// Plan the occurrence after `origin`.
    ///
    /// Advancing from the occurrence's own instant keeps the cadence
    /// drift-free; when the cadence is already behind the clock (wake-up
    /// gap) the next occurrence comes from `now` instead, so missed
    /// occurrences are not replayed.
    fn schedule_next(&self, job_id: JobId, origin: DateTime<Utc>, now: DateTime<Utc>) {
        let Some(active) = self.jobs.get(&job_id) else {
            return;
        };
        let from_origin = active.schedule.next_after(origin);
        let next = match from_origin {
            Ok(next) if next > now => Ok(next),
            Ok(_) => active.schedule.next_after(now),
            Err(error) => Err(error),
        };
        match next {
            Ok(next) => self.queue.push(QueueEntry::occurrence(job_id, next)),
            Err(error) => {
                warn!(job_id = %job_id, error = %error,
                    "no further occurrence within horizon, job goes idle");
            }
        }
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Reload => {
                self.refresh().await;
            }
            Control::DispatchNow { job_id, reply } => {
                let _ = reply.send(self.dispatch_now(job_id).await);
            }
            Control::SetActive {
                job_id,
                active,
                reply,
            } => {
                let result = match self.store.set_job_active(job_id, active).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(anyhow::anyhow!("unknown job {job_id}")),
                    Err(error) => Err(error.into()),
                };
                if result.is_ok() {
                    self.refresh().await;
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Plan an ad-hoc occurrence due immediately, bypassing the CRON
    /// expression. The execution row is created up front so its id can be
    /// handed back to the caller.
    async fn dispatch_now(&mut self, job_id: JobId) -> Result<ExecutionId> {
        if !self.jobs.contains_key(&job_id) {
            bail!("job {job_id} is not active");
        }

        let now = Utc::now();
        let execution_id = Uuid::new_v4();
        let execution = Execution {
            id: execution_id,
            job_id,
            scheduled_time: now,
            actual_start_time: None,
            finished_at: None,
            status: ExecutionStatus::Pending,
            http_status: None,
            duration_ms: None,
            attempt: 1,
            error_message: None,
            created_at: now,
        };
        store::with_retry("persist ad-hoc execution", || {
            self.store.upsert_execution(&execution)
        })
        .await?;

        self.queue.push(QueueEntry {
            job_id,
            scheduled_for: now,
            attempt: 1,
            origin_scheduled_for: now,
            execution_id: Some(execution_id),
        });
        info!(job_id = %job_id, execution_id = %execution_id, "ad-hoc dispatch planned");
        Ok(execution_id)
    }
}
