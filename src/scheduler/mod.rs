//! The scheduling and execution engine.
//!
//! [`SchedulerService`] owns the engine task's lifecycle and is managed by
//! the application's `ServiceManager`; [`SchedulerHandle`] is the control
//! surface handed to the CRUD adapter.

pub mod backoff;
mod engine;
pub mod pool;
pub mod queue;

use crate::data::models::{ExecutionId, JobId};
use crate::error::Result;
use crate::services::Service;
use crate::store::JobStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::engine::Engine;
use self::pool::{PoolConfig, WorkerPool};
use self::queue::DueQueue;

/// Tunables for the scheduling core. Defaults match the documented
/// configuration surface; tests shrink them for speed.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub max_workers: usize,
    /// Submissions the pool queues ahead of the running attempts.
    pub worker_backlog: usize,
    /// Per-attempt HTTP timeout.
    pub request_timeout: Duration,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Interval between store reconciliations.
    pub refresh_interval: Duration,
    /// Clamp on exponential retry backoff.
    pub backoff_cap: Duration,
    /// Truncation of captured failure response bodies.
    pub response_capture_bytes: usize,
    /// Whether shutdown waits for in-flight attempts to finish.
    pub drain_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            worker_backlog: 40,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            refresh_interval: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(64),
            response_capture_bytes: 4096,
            drain_on_shutdown: true,
        }
    }
}

/// Messages from the control surface into the engine task.
enum Control {
    Reload,
    DispatchNow {
        job_id: JobId,
        reply: oneshot::Sender<Result<ExecutionId>>,
    },
    SetActive {
        job_id: JobId,
        active: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable control surface over a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    control_tx: mpsc::Sender<Control>,
}

impl SchedulerHandle {
    /// Ask the scheduler to reconcile with the store now rather than at the
    /// next refresh tick.
    pub async fn reload_jobs(&self) -> Result<()> {
        self.send(Control::Reload).await
    }

    /// Fire an ad-hoc occurrence of `job_id` immediately, returning the id
    /// of its execution record.
    pub async fn dispatch_now(&self, job_id: JobId) -> Result<ExecutionId> {
        let (reply, response) = oneshot::channel();
        self.send(Control::DispatchNow { job_id, reply }).await?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("scheduler dropped the request"))?
    }

    /// Deactivate a job: its queue entry is removed, in-flight attempts run
    /// to completion.
    pub async fn pause(&self, job_id: JobId) -> Result<()> {
        self.set_active(job_id, false).await
    }

    /// Reactivate a paused job; occurrences resume from now.
    pub async fn resume(&self, job_id: JobId) -> Result<()> {
        self.set_active(job_id, true).await
    }

    async fn set_active(&self, job_id: JobId, active: bool) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Control::SetActive {
            job_id,
            active,
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("scheduler dropped the request"))?
    }

    async fn send(&self, control: Control) -> Result<()> {
        self.control_tx
            .send(control)
            .await
            .map_err(|_| anyhow::anyhow!("scheduler is not running"))
    }
}

/// Owns the engine task and wires it into the service lifecycle.
pub struct SchedulerService {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    handle: SchedulerHandle,
    control_rx: Option<mpsc::Receiver<Control>>,
    engine_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SchedulerService {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            store,
            config,
            handle: SchedulerHandle { control_tx },
            control_rx: Some(control_rx),
            engine_task: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Sweep leftovers of a previous unclean shutdown, then spawn the pool
    /// and the engine loop.
    pub async fn start(&mut self) {
        match self.store.sweep_abandoned(Utc::now()).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "failed abandoned executions from a previous run"),
            Err(error) => warn!(error = %error, "could not sweep abandoned executions"),
        }

        let queue = Arc::new(DueQueue::new());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(
            PoolConfig {
                workers: self.config.max_workers,
                backlog: self.config.worker_backlog,
                response_capture_bytes: self.config.response_capture_bytes,
            },
            self.store.clone(),
            outcome_tx,
        );

        let control_rx = self
            .control_rx
            .take()
            .expect("scheduler service started twice");
        let engine = Engine::new(
            self.store.clone(),
            queue,
            pool,
            outcome_rx,
            control_rx,
            self.config.clone(),
        );
        self.engine_task = Some(tokio::spawn(engine.run(self.cancel.clone())));
        info!("scheduler service started");
    }

    /// Stop the engine; it drains or cancels the pool per configuration.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.engine_task.take() {
            if let Err(join_error) = task.await {
                error!(error = %join_error, "scheduler task panicked");
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for SchedulerService {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(&mut self) -> Result<()> {
        self.start().await;
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}
