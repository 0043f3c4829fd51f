//! Bounded pool of HTTP callback executors.
//!
//! Each worker runs in its own task, pulling submissions off a bounded
//! channel, performing exactly one `POST` per task with a per-attempt
//! timeout, and reporting a structured [`Outcome`] back to the scheduler
//! over the outcome channel — the pool never touches the queue or the retry
//! state machine.

use crate::data::models::{ExecutionId, JobId};
use crate::store::{self, JobStore};
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use std::error::Error as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent executors.
    pub workers: usize,
    /// Submissions accepted beyond the running ones before the pool refuses.
    pub backlog: usize,
    /// Cap on how much of a failure response body is kept as the error
    /// message.
    pub response_capture_bytes: usize,
}

/// One dispatch handed to the pool: a single HTTP attempt.
#[derive(Debug, Clone)]
pub struct Task {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub target_url: String,
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
    /// Wall-clock budget for this attempt, independent of retry backoff.
    pub timeout: Duration,
}

/// Failure classification for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Timeout,
    ConnectionRefused,
    Dns,
    Tls,
    BadStatus,
    Other,
}

/// What happened to a single attempt.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub http_status: Option<i32>,
    pub duration_ms: i64,
    pub error_kind: ErrorKind,
    pub error_message: Option<String>,
}

impl Outcome {
    fn cancelled(duration_ms: i64) -> Self {
        Self {
            success: false,
            http_status: None,
            duration_ms,
            error_kind: ErrorKind::Other,
            error_message: Some("cancelled".to_string()),
        }
    }
}

/// An [`Outcome`] tagged with the attempt it belongs to, sent back to the
/// scheduler loop.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub attempt: u32,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
}

/// Returned by [`WorkerPool::submit`] when the backlog is full; the caller
/// gets the task back to re-plan it.
#[derive(Debug)]
pub struct Saturated(pub Task);

pub struct WorkerPool {
    task_tx: Option<mpsc::Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `config.workers` executor tasks.
    pub fn start(
        config: PoolConfig,
        store: Arc<dyn JobStore>,
        outcome_tx: mpsc::UnboundedSender<AttemptOutcome>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<Task>(config.backlog.max(1));
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let cancel = CancellationToken::new();

        let client = reqwest::Client::builder()
            .user_agent(concat!("cronhook/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build HTTP client");

        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    client: client.clone(),
                    store: store.clone(),
                    capture_bytes: config.response_capture_bytes,
                };
                let task_rx = task_rx.clone();
                let outcome_tx = outcome_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(task_rx, outcome_tx, cancel).await })
            })
            .collect();

        info!(workers = config.workers, backlog = config.backlog, "worker pool started");
        Self {
            task_tx: Some(task_tx),
            handles,
            cancel,
        }
    }

    /// Whether a submission would be accepted right now. Only the scheduler
    /// submits, so a positive answer cannot be invalidated by a competing
    /// producer.
    pub fn has_capacity(&self) -> bool {
        self.task_tx
            .as_ref()
            .is_some_and(|tx| tx.capacity() > 0)
    }

    /// Hand an attempt to the pool without blocking.
    pub fn submit(&self, task: Task) -> Result<(), Saturated> {
        let Some(tx) = self.task_tx.as_ref() else {
            return Err(Saturated(task));
        };
        tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(task) => Saturated(task),
            mpsc::error::TrySendError::Closed(task) => Saturated(task),
        })
    }

    /// Stop the pool.
    ///
    /// With `drain` the workers finish the submitted backlog and in-flight
    /// attempts, bounded by `deadline`; past the deadline (or without
    /// `drain`) in-flight attempts are cancelled and report a `cancelled`
    /// outcome.
    pub async fn shutdown(&mut self, drain: bool, deadline: Duration) {
        // Closing the channel lets workers run dry and exit.
        self.task_tx.take();
        if !drain {
            self.cancel.cancel();
        }

        let join_all = async {
            for handle in self.handles.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!(deadline = ?deadline, "worker pool drain deadline elapsed, cancelling");
            self.cancel.cancel();
            for handle in self.handles.drain(..) {
                let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
            }
        }
        debug!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    client: reqwest::Client,
    store: Arc<dyn JobStore>,
    capture_bytes: usize,
}

impl Worker {
    async fn run(
        &self,
        task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
        outcome_tx: mpsc::UnboundedSender<AttemptOutcome>,
        cancel: CancellationToken,
    ) {
        debug!(worker_id = self.id, "worker started");
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = async { task_rx.lock().await.recv().await } => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = self.execute(&task) => outcome,
                _ = cancel.cancelled() => {
                    Outcome::cancelled(started.elapsed().as_millis() as i64)
                }
            };

            if outcome.success {
                debug!(
                    worker_id = self.id,
                    job_id = %task.job_id,
                    attempt = task.attempt,
                    duration_ms = outcome.duration_ms,
                    "callback delivered"
                );
            } else {
                debug!(
                    worker_id = self.id,
                    job_id = %task.job_id,
                    attempt = task.attempt,
                    error_kind = ?outcome.error_kind,
                    http_status = outcome.http_status,
                    "callback attempt failed"
                );
            }

            let _ = outcome_tx.send(AttemptOutcome {
                execution_id: task.execution_id,
                job_id: task.job_id,
                attempt: task.attempt,
                finished_at: Utc::now(),
                outcome,
            });
        }
        debug!(worker_id = self.id, "worker exiting");
    }

    /// Perform one HTTP attempt: `POST` with an empty JSON body, success on
    /// any 2xx. Redirects are not followed; 3xx counts as a bad status.
    async fn execute(&self, task: &Task) -> Outcome {
        let started_at = Utc::now();
        let start_result = store::with_retry("record attempt start", || {
            self.store.record_attempt_start(task.execution_id, started_at)
        })
        .await;
        if let Err(error) = start_result {
            warn!(
                worker_id = self.id,
                execution_id = %task.execution_id,
                error = %error,
                "could not mark attempt running"
            );
        }

        let started = Instant::now();
        let response = self
            .client
            .post(&task.target_url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(task.timeout)
            .body("")
            .send()
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Outcome {
                        success: true,
                        http_status: Some(status.as_u16() as i32),
                        duration_ms,
                        error_kind: ErrorKind::None,
                        error_message: None,
                    }
                } else {
                    let body = response.bytes().await.unwrap_or_default();
                    let captured = truncate_body(&body, self.capture_bytes);
                    Outcome {
                        success: false,
                        http_status: Some(status.as_u16() as i32),
                        duration_ms,
                        error_kind: ErrorKind::BadStatus,
                        error_message: Some(if captured.is_empty() {
                            format!("unexpected status {status}")
                        } else {
                            captured
                        }),
                    }
                }
            }
            Err(error) => {
                let kind = classify_error(&error);
                Outcome {
                    success: false,
                    http_status: None,
                    duration_ms,
                    error_kind: kind,
                    error_message: Some(error.to_string()),
                }
            }
        }
    }
}

fn truncate_body(body: &[u8], cap: usize) -> String {
    let slice = &body[..body.len().min(cap)];
    String::from_utf8_lossy(slice).into_owned()
}

/// Map a transport error onto the outcome taxonomy by walking its source
/// chain.
fn classify_error(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        return ErrorKind::Timeout;
    }
    if !error.is_connect() {
        return ErrorKind::Other;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionRefused
        {
            return ErrorKind::ConnectionRefused;
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns") {
            return ErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return ErrorKind::Tls;
        }
        source = cause.source();
    }
    ErrorKind::ConnectionRefused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_at_cap_boundary() {
        let body = vec![b'x'; 10_000];
        let captured = truncate_body(&body, 4096);
        assert_eq!(captured.len(), 4096);
    }

    #[test]
    fn short_bodies_kept_whole() {
        assert_eq!(truncate_body(b"boom", 4096), "boom");
        assert_eq!(truncate_body(b"", 4096), "");
    }

    #[test]
    fn lossy_capture_of_invalid_utf8() {
        let captured = truncate_body(&[0xff, 0xfe, b'o', b'k'], 4096);
        assert!(captured.ends_with("ok"));
    }
}
