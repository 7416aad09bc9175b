//! Integration tests for the PostgreSQL queue store.
//!
//! This test suite validates:
//! - FIFO claiming with `SKIP LOCKED` under concurrent workers
//! - Retry into `delayed` and claim once due
//! - Input exclusivity through the partial unique index
//! - Conditional removal of pending jobs
//! - Both listing modes and lease reclaim
//!
//! The scenarios share one table, so they run sequentially inside a single
//! test. Skipped unless `DATABASE_URL` points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docconv_db::{
    create_pool, Error, JobPayload, JobState, JobStore, JobType, JobUpdate, NewJob, PageMode,
    PgJobStore, StateFilter,
};
use serde_json::json;
use sqlx::PgPool;

const LEASE: Duration = Duration::from_secs(30);

async fn setup_store() -> Option<PgJobStore> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let pool: PgPool = create_pool(&database_url)
        .await
        .expect("Failed to create test pool");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    sqlx::query("TRUNCATE job_queue")
        .execute(&pool)
        .await
        .expect("Failed to truncate job_queue");
    Some(PgJobStore::new(pool))
}

fn new_job(name: &str) -> NewJob {
    NewJob::new(JobType::PdfToText, JobPayload::new(format!("/in/{}.pdf", name)))
}

#[tokio::test]
async fn test_pg_job_store_lifecycle() {
    let Some(store) = setup_store().await else {
        eprintln!("DATABASE_URL not set; skipping PostgreSQL store tests");
        return;
    };
    let store = Arc::new(store);

    // ========================================================================
    // FIFO + concurrent claims
    // ========================================================================
    let mut created = Vec::new();
    for i in 0..6 {
        created.push(store.create(new_job(&format!("fifo-{}", i))).await.unwrap());
    }
    let first = store.claim_next("w-0", LEASE).await.unwrap().unwrap();
    assert_eq!(first.id, created[0].id);
    assert_eq!(first.state, JobState::Active);
    assert!(first.processed_at.is_some());

    let claims = futures::future::join_all((1..6).map(|i| {
        let store = store.clone();
        async move {
            store
                .claim_next(&format!("w-{}", i), LEASE)
                .await
                .unwrap()
                .map(|j| j.id)
        }
    }))
    .await;
    let mut ids: Vec<_> = claims.into_iter().flatten().collect();
    let claimed = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), claimed, "a job was claimed twice");
    while let Some(job) = store.claim_next("w-x", LEASE).await.unwrap() {
        assert!(!ids.contains(&job.id));
        ids.push(job.id);
    }
    assert_eq!(ids.len(), 5);

    // ========================================================================
    // Retry, delayed eligibility, completion
    // ========================================================================
    let retried = store
        .update(
            first.id,
            JobUpdate::Retry {
                worker_id: "w-0".into(),
                reason: "pdftotext crashed".into(),
                delay: Duration::ZERO,
            },
        )
        .await
        .unwrap();
    assert_eq!(retried.state, JobState::Delayed);
    assert_eq!(retried.attempts_made, 1);

    let again = store.claim_next("w-0", LEASE).await.unwrap().unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.processed_at, first.processed_at);

    let done = store
        .update(
            first.id,
            JobUpdate::Complete {
                worker_id: "w-0".into(),
                result: json!({"path": "/out/x.txt"}),
            },
        )
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts_made, 2);

    let err = store
        .update(
            first.id,
            JobUpdate::Fail {
                worker_id: "w-0".into(),
                reason: "late".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // ========================================================================
    // Input exclusivity
    // ========================================================================
    let err = store.create(new_job("fifo-1")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    store.create(new_job("fifo-0")).await.unwrap();

    // ========================================================================
    // Conditional removal
    // ========================================================================
    let pending = store.create(new_job("pending")).await.unwrap();
    let removed = store.remove_if_pending(pending.id).await.unwrap();
    assert_eq!(removed.id, pending.id);
    assert!(matches!(
        store.get(pending.id).await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        store.remove_if_pending(created[1].id).await.unwrap_err(),
        Error::InvalidState(_)
    ));

    // ========================================================================
    // Listing
    // ========================================================================
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.active, 5);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.total, 7);

    let per_state = store
        .list(StateFilter::All, 0, 1, PageMode::PerState)
        .await
        .unwrap();
    assert_eq!(per_state.total, 7);
    let states: Vec<_> = per_state.jobs.iter().map(|j| j.state).collect();
    assert_eq!(
        states,
        vec![JobState::Waiting, JobState::Active, JobState::Completed]
    );

    let global = store
        .list(StateFilter::All, 0, 2, PageMode::Global)
        .await
        .unwrap();
    assert_eq!(global.jobs.len(), 2);
    assert_eq!(global.jobs[0].id, created[0].id);

    // ========================================================================
    // Lease reclaim
    // ========================================================================
    store
        .update(created[2].id, JobUpdate::RequestCancel)
        .await
        .unwrap();
    let later = Utc::now() + chrono::Duration::seconds(120);
    let reclaimed = store.reclaim_expired(later).await.unwrap();
    assert_eq!(reclaimed.len(), 5);
    let cancelled: Vec<_> = reclaimed
        .iter()
        .filter(|j| j.state == JobState::Cancelled)
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, created[2].id);

    // ========================================================================
    // Retention
    // ========================================================================
    let removed = store.cleanup(later).await.unwrap();
    assert_eq!(removed, 2);
    store.ping().await.unwrap();
}
