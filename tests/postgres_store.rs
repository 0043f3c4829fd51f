#[allow(dead_code)]
mod helpers;

use chrono::Utc;
use cronhook::data::models::{ExecutionStatus, ExecutionType, TerminalUpdate};
use cronhook::store::postgres::PostgresStore;
use cronhook::store::{JobStore, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

// ── jobs ────────────────────────────────────────────────────────────

#[sqlx::test]
async fn insert_and_list_active_jobs(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let active = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();
    let mut inactive = helpers::new_job(
        "0 * * * * *",
        "https://example.com/other",
        ExecutionType::AtMostOnce,
    );
    inactive.active = false;
    store.insert_job(&inactive).await.unwrap();

    let listed = store.list_active_jobs().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, active.id);
    assert_eq!(listed[0].schedule, "0 * * * * *");
    assert_eq!(listed[0].execution_type, ExecutionType::AtLeastOnce);
}

#[sqlx::test]
async fn insert_rejects_five_field_cron(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());

    let result = store
        .insert_job(&helpers::new_job(
            "0 * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await;
    assert!(matches!(result, Err(StoreError::Invalid(_))));

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "rejected job must not be persisted");
}

#[sqlx::test]
async fn insert_rejects_non_http_url(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let result = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "ftp://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await;
    assert!(matches!(result, Err(StoreError::Invalid(_))));
}

#[sqlx::test]
async fn get_job_roundtrip(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let inserted = store
        .insert_job(&helpers::new_job(
            "*/5 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtMostOnce,
        ))
        .await
        .unwrap();

    let fetched = store.get_job(inserted.id).await.unwrap().unwrap();
    assert_eq!(fetched.schedule, "*/5 * * * * *");
    assert_eq!(fetched.execution_type, ExecutionType::AtMostOnce);

    assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
}

#[sqlx::test]
async fn set_job_active_toggles(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();

    assert!(store.set_job_active(job.id, false).await.unwrap());
    assert!(store.list_active_jobs().await.unwrap().is_empty());

    assert!(store.set_job_active(job.id, true).await.unwrap());
    assert_eq!(store.list_active_jobs().await.unwrap().len(), 1);

    assert!(!store.set_job_active(Uuid::new_v4(), true).await.unwrap());
}

#[sqlx::test]
async fn delete_job_cascades_executions(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();
    store
        .upsert_execution(&helpers::pending_execution(job.id, Utc::now(), 1))
        .await
        .unwrap();

    assert!(store.delete_job(job.id).await.unwrap());
    assert!(!store.delete_job(job.id).await.unwrap());

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_executions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "executions must be removed with their job");
}

// ── executions ──────────────────────────────────────────────────────

#[sqlx::test]
async fn upsert_execution_is_idempotent(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();

    let mut execution = helpers::pending_execution(job.id, Utc::now(), 1);
    store.upsert_execution(&execution).await.unwrap();

    // Re-inserting under the same id must not clobber the row.
    execution.attempt = 99;
    store.upsert_execution(&execution).await.unwrap();

    let rows = store.list_executions(job.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt, 1);
    assert_eq!(rows[0].status, ExecutionStatus::Pending);
}

#[sqlx::test]
async fn record_attempt_start_transitions_pending_only(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();
    let execution = helpers::pending_execution(job.id, Utc::now(), 1);
    store.upsert_execution(&execution).await.unwrap();

    let started_at = Utc::now();
    assert!(
        store
            .record_attempt_start(execution.id, started_at)
            .await
            .unwrap()
    );

    let rows = store.list_executions(job.id).await.unwrap();
    assert_eq!(rows[0].status, ExecutionStatus::Running);
    assert!(rows[0].actual_start_time.is_some());
    assert!(rows[0].drift().unwrap() >= chrono::Duration::zero());

    // Already running; the guard must reject a second transition.
    assert!(
        !store
            .record_attempt_start(execution.id, Utc::now())
            .await
            .unwrap()
    );
}

#[sqlx::test]
async fn terminal_statuses_are_monotone(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();
    let execution = helpers::pending_execution(job.id, Utc::now(), 1);
    store.upsert_execution(&execution).await.unwrap();

    let success = TerminalUpdate {
        status: ExecutionStatus::Success,
        http_status: Some(200),
        duration_ms: Some(42),
        finished_at: Utc::now(),
        error_message: None,
    };
    assert!(
        store
            .update_execution_terminal(execution.id, &success)
            .await
            .unwrap()
    );

    // A late competing write must not take effect.
    let failure = TerminalUpdate {
        status: ExecutionStatus::Failed,
        http_status: Some(500),
        duration_ms: Some(7),
        finished_at: Utc::now(),
        error_message: Some("late".to_string()),
    };
    assert!(
        !store
            .update_execution_terminal(execution.id, &failure)
            .await
            .unwrap()
    );

    let rows = store.list_executions(job.id).await.unwrap();
    assert_eq!(rows[0].status, ExecutionStatus::Success);
    assert_eq!(rows[0].http_status, Some(200));
    assert_eq!(rows[0].error_message, None);
}

#[sqlx::test]
async fn retrying_rows_accept_no_further_attempt_writes_after_terminal(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();
    let execution = helpers::pending_execution(job.id, Utc::now(), 1);
    store.upsert_execution(&execution).await.unwrap();

    let retrying = TerminalUpdate {
        status: ExecutionStatus::Retrying,
        http_status: Some(503),
        duration_ms: Some(12),
        finished_at: Utc::now(),
        error_message: Some("boom".to_string()),
    };
    assert!(
        store
            .update_execution_terminal(execution.id, &retrying)
            .await
            .unwrap()
    );

    let rows = store.list_executions(job.id).await.unwrap();
    assert_eq!(rows[0].status, ExecutionStatus::Retrying);
    assert_eq!(rows[0].http_status, Some(503));
    assert_eq!(rows[0].error_message.as_deref(), Some("boom"));
}

#[sqlx::test]
async fn sweep_fails_abandoned_rows(pool: PgPool) {
    let store = PostgresStore::new(pool);

    let job = store
        .insert_job(&helpers::new_job(
            "0 * * * * *",
            "https://example.com/hook",
            ExecutionType::AtLeastOnce,
        ))
        .await
        .unwrap();

    let stale_pending = helpers::pending_execution(job.id, Utc::now(), 1);
    store.upsert_execution(&stale_pending).await.unwrap();

    let finished = helpers::pending_execution(job.id, Utc::now(), 1);
    store.upsert_execution(&finished).await.unwrap();
    store
        .update_execution_terminal(
            finished.id,
            &TerminalUpdate {
                status: ExecutionStatus::Success,
                http_status: Some(200),
                duration_ms: Some(5),
                finished_at: Utc::now(),
                error_message: None,
            },
        )
        .await
        .unwrap();

    let swept = store
        .sweep_abandoned(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let rows = store.list_executions(job.id).await.unwrap();
    let swept_row = rows.iter().find(|r| r.id == stale_pending.id).unwrap();
    assert_eq!(swept_row.status, ExecutionStatus::Failed);
    assert_eq!(swept_row.error_message.as_deref(), Some("abandoned"));
    let kept_row = rows.iter().find(|r| r.id == finished.id).unwrap();
    assert_eq!(kept_row.status, ExecutionStatus::Success);
}
