use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use chrono::{DateTime, Utc};
use cronhook::data::models::{Execution, ExecutionStatus, ExecutionType, JobId, NewJob};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Build a job definition with the given cadence and delivery semantics.
pub fn new_job(schedule: &str, target_url: &str, execution_type: ExecutionType) -> NewJob {
    NewJob {
        schedule: schedule.to_string(),
        target_url: target_url.to_string(),
        execution_type,
        active: true,
    }
}

/// Build a fresh `PENDING` execution row for one attempt of an occurrence.
pub fn pending_execution(job_id: JobId, scheduled_time: DateTime<Utc>, attempt: i32) -> Execution {
    Execution {
        id: Uuid::new_v4(),
        job_id,
        scheduled_time,
        actual_start_time: None,
        finished_at: None,
        status: ExecutionStatus::Pending,
        http_status: None,
        duration_ms: None,
        attempt,
        error_message: None,
        created_at: Utc::now(),
    }
}

/// A local HTTP callback target that counts hits.
pub struct TargetServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
}

impl TargetServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Serve a callback target on an ephemeral port.
///
/// `respond` maps the 0-based hit index to the status returned for that
/// request; non-2xx responses carry the body `"boom"`.
pub async fn spawn_target(
    respond: impl Fn(usize) -> StatusCode + Send + Sync + 'static,
) -> TargetServer {
    let respond = Arc::new(respond);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let app = Router::new().route(
        "/hook",
        post(move || {
            let respond = respond.clone();
            let counter = counter.clone();
            async move {
                let status = respond(counter.fetch_add(1, Ordering::SeqCst));
                (status, "boom")
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind target server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TargetServer {
        url: format!("http://{addr}/hook"),
        hits,
    }
}

/// Serve a callback target that stalls for `delay` before answering 200,
/// keeping attempts in flight for shutdown scenarios.
pub async fn spawn_stalled_target(delay: std::time::Duration) -> TargetServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let app = Router::new().route(
        "/hook",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                StatusCode::OK
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind target server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TargetServer {
        url: format!("http://{addr}/hook"),
        hits,
    }
}

/// An address nothing listens on, for connection-failure scenarios.
pub async fn refused_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/hook")
}
