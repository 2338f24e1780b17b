use std::time::Duration;

use vidmood::{
    config::AppConfig,
    db::{self, queries, queries::RegistryError},
    models::job::{FailureKind, JobState},
    services::dispatch::{self, DispatchClient, DispatchHealth},
    services::storage::{AssetKind, AssetStore, LocalStore},
};
use uuid::Uuid;

/// Dispatch client pointed at a port nothing listens on.
fn unreachable_dispatcher() -> DispatchClient {
    DispatchClient::new("http://127.0.0.1:9", Duration::from_millis(300))
        .expect("Failed to build dispatch client")
}

/// Integration test: registry lifecycle against a live PostgreSQL.
///
/// Exercises the full state machine of one job: creation, dispatch,
/// claim, heartbeat, completion, and the asset store alongside it.
///
/// Note: This requires a running PostgreSQL instance configured via
/// environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_lifecycle() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let scratch = tempfile::tempdir().expect("tempdir");
    let store = AssetStore::Local(
        LocalStore::new(
            scratch.path().join("uploaded").to_str().unwrap(),
            scratch.path().join("processed").to_str().unwrap(),
        )
        .expect("Failed to initialize store"),
    );

    // 1. Store a raw asset and register the job against its key
    let job_id = Uuid::new_v4();
    let source_key = AssetKind::Raw.key(job_id, "mp4");
    store
        .put(AssetKind::Raw, &source_key, b"fake video bytes")
        .await
        .expect("put failed");

    let job = queries::create_job(&db_pool, job_id, &source_key, Some(2.0))
        .await
        .expect("Failed to create job");

    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.source_key, source_key);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.sample_fps, Some(2.0));
    assert!(!job.cancel_requested);

    // 2. Newly queued jobs show up in the dispatch scan
    let dispatchable = queries::find_dispatchable(&db_pool, 100)
        .await
        .expect("scan failed");
    assert!(dispatchable.iter().any(|j| j.id == job_id));

    // 3. Walk the happy path: queued -> dispatched -> processing
    let job = queries::transition(&db_pool, job_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch transition failed");
    assert_eq!(job.state, JobState::Dispatched);

    let job = queries::transition(&db_pool, job_id, JobState::Dispatched, JobState::Processing)
        .await
        .expect("claim failed");
    assert_eq!(job.state, JobState::Processing);

    // 4. Heartbeat reports no cancellation while processing
    let cancel = queries::poll_processing_heartbeat(&db_pool, job_id)
        .await
        .expect("heartbeat failed");
    assert_eq!(cancel, Some(false));

    // 5. Completion attaches the result keys
    let result_key = AssetKind::Timeline.key(job_id, "json");
    store
        .put(AssetKind::Timeline, &result_key, b"{\"records\":[]}")
        .await
        .expect("put failed");
    let job = queries::complete_job(&db_pool, job_id, &result_key, None)
        .await
        .expect("completion failed");
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result_key.as_deref(), Some(result_key.as_str()));

    // 6. A completed job refuses further transitions
    let err = queries::transition(&db_pool, job_id, JobState::Completed, JobState::Processing)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::IllegalTransition { .. }));

    // 7. Heartbeat on a non-processing job signals lost ownership
    let cancel = queries::poll_processing_heartbeat(&db_pool, job_id)
        .await
        .expect("heartbeat failed");
    assert_eq!(cancel, None);

    // 8. Asset round-trips through the store
    let bytes = store
        .get(AssetKind::Raw, &source_key)
        .await
        .expect("get failed");
    assert_eq!(bytes, b"fake video bytes");
}

/// Two workers racing for the same dispatched job: exactly one claim wins.
#[tokio::test]
#[ignore]
async fn test_concurrent_claim_single_winner() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let job_id = Uuid::new_v4();
    queries::create_job(&db_pool, job_id, &format!("{job_id}.mp4"), None)
        .await
        .expect("Failed to create job");
    queries::transition(&db_pool, job_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch transition failed");

    let (a, b) = futures::join!(
        queries::transition(&db_pool, job_id, JobState::Dispatched, JobState::Processing),
        queries::transition(&db_pool, job_id, JobState::Dispatched, JobState::Processing),
    );

    let winners = [a.is_ok(), b.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1, "exactly one claim must win the CAS");

    let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(
        loser,
        RegistryError::Conflict {
            actual: JobState::Processing,
            ..
        }
    ));
}

/// Retries re-queue a failed job until the attempt budget is spent.
#[tokio::test]
#[ignore]
async fn test_retry_budget_is_bounded() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let max_attempts = 2;
    let job_id = Uuid::new_v4();
    queries::create_job(&db_pool, job_id, &format!("{job_id}.webm"), None)
        .await
        .expect("Failed to create job");

    for attempt in 1..=max_attempts {
        queries::fail_job(
            &db_pool,
            job_id,
            JobState::Queued,
            FailureKind::Decode,
            "synthetic failure",
        )
        .await
        .expect("fail transition failed");

        let job = queries::retry_job(&db_pool, job_id, max_attempts)
            .await
            .expect("retry should be allowed within budget");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, attempt);
        assert!(job.error.is_none(), "retry must clear the failure cause");
    }

    // Budget spent: the next retry is refused and the job stays failed.
    queries::fail_job(
        &db_pool,
        job_id,
        JobState::Queued,
        FailureKind::Decode,
        "synthetic failure",
    )
    .await
    .expect("fail transition failed");

    let err = queries::retry_job(&db_pool, job_id, max_attempts)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::RetryExhausted { .. }));

    let job = queries::get_job(&db_pool, job_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Failed);
}

/// Dispatch rollback burns an attempt and defers the next scan.
#[tokio::test]
#[ignore]
async fn test_dispatch_rollback_schedules_backoff() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let job_id = Uuid::new_v4();
    queries::create_job(&db_pool, job_id, &format!("{job_id}.mp4"), None)
        .await
        .expect("Failed to create job");
    queries::transition(&db_pool, job_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch transition failed");

    let next_try = chrono::Utc::now() + chrono::Duration::seconds(3600);
    let attempts = queries::requeue_after_dispatch_failure(&db_pool, job_id, next_try)
        .await
        .expect("rollback failed");
    assert_eq!(attempts, 1);

    let job = queries::get_job(&db_pool, job_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Queued);

    // An hour of backoff keeps the job out of the dispatch scan.
    let dispatchable = queries::find_dispatchable(&db_pool, 1000)
        .await
        .expect("scan failed");
    assert!(!dispatchable.iter().any(|j| j.id == job_id));
}

/// An unreachable processing server ends in `failed(dispatch_exhausted)`
/// with `attempts` exactly at the configured maximum.
#[tokio::test]
#[ignore]
async fn test_unreachable_processor_exhausts_dispatch_budget() {
    let mut config = AppConfig::from_env().expect("Failed to load config");
    config.max_attempts = 3;
    config.dispatch_backoff_ms = 1;

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let client = unreachable_dispatcher();
    let mut health = DispatchHealth::default();

    let job_id = Uuid::new_v4();
    queries::create_job(&db_pool, job_id, &format!("{job_id}.mp4"), None)
        .await
        .expect("Failed to create job");

    for _ in 0..10 {
        let job = queries::get_job(&db_pool, job_id)
            .await
            .expect("get failed")
            .expect("job missing");
        if job.state == JobState::Failed {
            break;
        }
        let accepted = dispatch::attempt(&db_pool, &client, &config, &mut health, &job).await;
        assert!(!accepted, "dispatch to a closed port must not be accepted");
    }

    let job = queries::get_job(&db_pool, job_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.error.as_ref().map(|e| e.kind),
        Some(FailureKind::DispatchExhausted)
    );
    assert_eq!(
        job.attempts, config.max_attempts,
        "attempts must land exactly on the budget"
    );
}

/// A retry that re-queues at the budget boundary must fail as exhausted on
/// the next dispatch pass without incrementing `attempts` past the maximum.
#[tokio::test]
#[ignore]
async fn test_retry_at_budget_boundary_does_not_over_increment() {
    let mut config = AppConfig::from_env().expect("Failed to load config");
    config.max_attempts = 3;
    config.dispatch_backoff_ms = 1;

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let job_id = Uuid::new_v4();
    queries::create_job(&db_pool, job_id, &format!("{job_id}.mp4"), None)
        .await
        .expect("Failed to create job");

    // Burn attempts up to max - 1 through dispatch rollbacks.
    for _ in 0..(config.max_attempts - 1) {
        queries::transition(&db_pool, job_id, JobState::Queued, JobState::Dispatched)
            .await
            .expect("dispatch transition failed");
        queries::requeue_after_dispatch_failure(&db_pool, job_id, chrono::Utc::now())
            .await
            .expect("rollback failed");
    }

    // The job then fails in processing and the client retries it, landing
    // back in `queued` with attempts at the maximum.
    queries::transition(&db_pool, job_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch transition failed");
    queries::transition(&db_pool, job_id, JobState::Dispatched, JobState::Processing)
        .await
        .expect("claim failed");
    queries::fail_job(
        &db_pool,
        job_id,
        JobState::Processing,
        FailureKind::Decode,
        "synthetic failure",
    )
    .await
    .expect("fail transition failed");

    let job = queries::retry_job(&db_pool, job_id, config.max_attempts)
        .await
        .expect("retry within budget must be allowed");
    assert_eq!(job.attempts, config.max_attempts);

    let client = unreachable_dispatcher();
    let mut health = DispatchHealth::default();
    let accepted = dispatch::attempt(&db_pool, &client, &config, &mut health, &job).await;
    assert!(!accepted);

    let job = queries::get_job(&db_pool, job_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.error.as_ref().map(|e| e.kind),
        Some(FailureKind::DispatchExhausted)
    );
    assert_eq!(
        job.attempts, config.max_attempts,
        "attempts must never exceed the budget"
    );
}

/// Jobs stranded by a crashed peer are swept back to `queued`; live jobs
/// with a fresh heartbeat are left alone.
#[tokio::test]
#[ignore]
async fn test_stale_jobs_are_requeued() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    // A processor that acked and died leaves the job in `dispatched`.
    let stranded_id = Uuid::new_v4();
    queries::create_job(&db_pool, stranded_id, &format!("{stranded_id}.mp4"), None)
        .await
        .expect("Failed to create job");
    queries::transition(&db_pool, stranded_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch transition failed");

    // A cutoff in the future treats any row as stale.
    let future_cutoff = chrono::Utc::now() + chrono::Duration::seconds(5);
    let swept = queries::requeue_stale(&db_pool, JobState::Dispatched, future_cutoff, 3)
        .await
        .expect("sweep failed");
    assert!(swept.contains(&stranded_id));

    let job = queries::get_job(&db_pool, stranded_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1, "a sweep burns one attempt");

    // A worker that died mid-run leaves `processing` with a silent heartbeat.
    let lost_id = Uuid::new_v4();
    queries::create_job(&db_pool, lost_id, &format!("{lost_id}.mp4"), None)
        .await
        .expect("Failed to create job");
    queries::transition(&db_pool, lost_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch transition failed");
    queries::transition(&db_pool, lost_id, JobState::Dispatched, JobState::Processing)
        .await
        .expect("claim failed");

    // With a cutoff in the past the fresh heartbeat protects the job.
    let past_cutoff = chrono::Utc::now() - chrono::Duration::seconds(3600);
    let swept = queries::requeue_stale(&db_pool, JobState::Processing, past_cutoff, 3)
        .await
        .expect("sweep failed");
    assert!(!swept.contains(&lost_id));

    let swept = queries::requeue_stale(&db_pool, JobState::Processing, future_cutoff, 3)
        .await
        .expect("sweep failed");
    assert!(swept.contains(&lost_id));

    let job = queries::get_job(&db_pool, lost_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Queued);

    // The abandoned worker's next heartbeat reports lost ownership.
    let heartbeat = queries::poll_processing_heartbeat(&db_pool, lost_id)
        .await
        .expect("heartbeat failed");
    assert_eq!(heartbeat, None);
}

/// Cancelling before processing fails the job immediately; cancelling while
/// processing only raises the flag.
#[tokio::test]
#[ignore]
async fn test_cancellation_paths() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    // Queued job: direct transition to failed(cancelled)
    let queued_id = Uuid::new_v4();
    queries::create_job(&db_pool, queued_id, &format!("{queued_id}.mp4"), None)
        .await
        .expect("Failed to create job");
    let job = queries::fail_job(
        &db_pool,
        queued_id,
        JobState::Queued,
        FailureKind::Cancelled,
        "cancelled before processing",
    )
    .await
    .expect("cancel failed");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.as_ref().map(|e| e.kind), Some(FailureKind::Cancelled));

    // Processing job: flag only, state unchanged, heartbeat reports it
    let active_id = Uuid::new_v4();
    queries::create_job(&db_pool, active_id, &format!("{active_id}.mp4"), None)
        .await
        .expect("Failed to create job");
    queries::transition(&db_pool, active_id, JobState::Queued, JobState::Dispatched)
        .await
        .expect("dispatch failed");
    queries::transition(&db_pool, active_id, JobState::Dispatched, JobState::Processing)
        .await
        .expect("claim failed");

    let flagged = queries::request_cancel(&db_pool, active_id)
        .await
        .expect("request_cancel failed");
    assert!(flagged);

    let job = queries::get_job(&db_pool, active_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(job.state, JobState::Processing);
    assert!(job.cancel_requested);

    let cancel = queries::poll_processing_heartbeat(&db_pool, active_id)
        .await
        .expect("heartbeat failed");
    assert_eq!(cancel, Some(true));

    // request_cancel on a non-processing job is a no-op
    let flagged = queries::request_cancel(&db_pool, queued_id)
        .await
        .expect("request_cancel failed");
    assert!(!flagged);
}
