use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{AnalysisJob, FailureKind, JobError, JobState};

/// Column list shared by every query returning a full job row.
const JOB_COLUMNS: &str = "id, state, source_key, result_key, rendered_key, \
     error_kind, error_detail, attempts, sample_fps, cancel_requested, \
     next_dispatch_at, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job {job_id} not found")]
    NotFound { job_id: Uuid },

    /// The compare-and-swap guard failed: the row was not in the expected
    /// state. This is the sole concurrency-safety mechanism for claims.
    #[error("job {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: Uuid,
        expected: JobState,
        actual: JobState,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("retry budget exhausted for job {job_id}")]
    RetryExhausted { job_id: Uuid },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, sqlx::Error> {
    let state_str: String = row.try_get("state")?;
    let state = JobState::from_str(&state_str)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error = match error_kind {
        Some(kind) => {
            let kind = FailureKind::from_str(&kind)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            let detail: Option<String> = row.try_get("error_detail")?;
            Some(JobError {
                kind,
                detail: detail.unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(AnalysisJob {
        id: row.try_get("id")?,
        state,
        source_key: row.try_get("source_key")?,
        result_key: row.try_get("result_key")?,
        rendered_key: row.try_get("rendered_key")?,
        error,
        attempts: row.try_get("attempts")?,
        sample_fps: row.try_get("sample_fps")?,
        cancel_requested: row.try_get("cancel_requested")?,
        next_dispatch_at: row.try_get("next_dispatch_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new job in state `queued`. The caller supplies the id so the
/// raw asset can be keyed by it before the row exists.
pub async fn create_job(
    pool: &PgPool,
    job_id: Uuid,
    source_key: &str,
    sample_fps: Option<f64>,
) -> Result<AnalysisJob, RegistryError> {
    let sql = format!(
        "INSERT INTO analysis_jobs (id, source_key, sample_fps) \
         VALUES ($1, $2, $3) RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(source_key)
        .bind(sample_fps)
        .fetch_one(pool)
        .await?;
    Ok(job_from_row(&row)?)
}

/// Get a job by id.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<AnalysisJob>, RegistryError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
}

/// List jobs, optionally filtered by state, newest first.
pub async fn list_jobs(
    pool: &PgPool,
    state: Option<JobState>,
    limit: i64,
) -> Result<Vec<AnalysisJob>, RegistryError> {
    let rows = match state {
        Some(state) => {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM analysis_jobs \
                 WHERE state = $1 ORDER BY created_at DESC LIMIT $2"
            );
            sqlx::query(&sql)
                .bind(state.to_string())
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM analysis_jobs \
                 ORDER BY created_at DESC LIMIT $1"
            );
            sqlx::query(&sql).bind(limit).fetch_all(pool).await?
        }
    };
    rows.iter()
        .map(job_from_row)
        .collect::<Result<_, _>>()
        .map_err(Into::into)
}

/// Resolve a zero-row CAS update into the precise error.
async fn conflict_or_not_found(
    pool: &PgPool,
    job_id: Uuid,
    expected: JobState,
) -> RegistryError {
    match get_job(pool, job_id).await {
        Ok(Some(job)) => RegistryError::Conflict {
            job_id,
            expected,
            actual: job.state,
        },
        Ok(None) => RegistryError::NotFound { job_id },
        Err(e) => e,
    }
}

/// Compare-and-swap state transition: succeeds only if the job is currently
/// in `from`. A mismatch yields `Conflict` rather than silently overwriting.
pub async fn transition(
    pool: &PgPool,
    job_id: Uuid,
    from: JobState,
    to: JobState,
) -> Result<AnalysisJob, RegistryError> {
    if !JobState::can_transition(from, to) {
        return Err(RegistryError::IllegalTransition { from, to });
    }

    let sql = format!(
        "UPDATE analysis_jobs SET state = $3, updated_at = NOW() \
         WHERE id = $1 AND state = $2 RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(job_from_row(&r)?),
        None => Err(conflict_or_not_found(pool, job_id, from).await),
    }
}

/// CAS Processing -> Completed, attaching the result asset keys.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    result_key: &str,
    rendered_key: Option<&str>,
) -> Result<AnalysisJob, RegistryError> {
    let sql = format!(
        "UPDATE analysis_jobs \
         SET state = 'completed', result_key = $2, rendered_key = $3, updated_at = NOW() \
         WHERE id = $1 AND state = 'processing' RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(result_key)
        .bind(rendered_key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(job_from_row(&r)?),
        None => Err(conflict_or_not_found(pool, job_id, JobState::Processing).await),
    }
}

/// CAS `from` -> Failed, recording the structured cause.
pub async fn fail_job(
    pool: &PgPool,
    job_id: Uuid,
    from: JobState,
    kind: FailureKind,
    detail: &str,
) -> Result<AnalysisJob, RegistryError> {
    if !JobState::can_transition(from, JobState::Failed) {
        return Err(RegistryError::IllegalTransition {
            from,
            to: JobState::Failed,
        });
    }

    let sql = format!(
        "UPDATE analysis_jobs \
         SET state = 'failed', error_kind = $3, error_detail = $4, updated_at = NOW() \
         WHERE id = $1 AND state = $2 RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(from.to_string())
        .bind(kind.to_string())
        .bind(detail)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => Ok(job_from_row(&r)?),
        None => Err(conflict_or_not_found(pool, job_id, from).await),
    }
}

/// Bounded retry: CAS Failed -> Queued with attempts incremented, refused
/// once the attempt budget is spent.
pub async fn retry_job(
    pool: &PgPool,
    job_id: Uuid,
    max_attempts: i32,
) -> Result<AnalysisJob, RegistryError> {
    let sql = format!(
        "UPDATE analysis_jobs \
         SET state = 'queued', attempts = attempts + 1, \
             error_kind = NULL, error_detail = NULL, cancel_requested = FALSE, \
             next_dispatch_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND state = 'failed' AND attempts < $2 \
         RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(max_attempts)
        .fetch_optional(pool)
        .await?;

    if let Some(r) = row {
        return Ok(job_from_row(&r)?);
    }

    match get_job(pool, job_id).await? {
        None => Err(RegistryError::NotFound { job_id }),
        Some(job) if job.state != JobState::Failed => Err(RegistryError::Conflict {
            job_id,
            expected: JobState::Failed,
            actual: job.state,
        }),
        Some(_) => Err(RegistryError::RetryExhausted { job_id }),
    }
}

/// Roll an optimistic `Dispatched` back to `Queued` after a failed dispatch
/// call, burning one attempt and scheduling the next try.
pub async fn requeue_after_dispatch_failure(
    pool: &PgPool,
    job_id: Uuid,
    next_dispatch_at: DateTime<Utc>,
) -> Result<i32, RegistryError> {
    let row = sqlx::query(
        "UPDATE analysis_jobs \
         SET state = 'queued', attempts = attempts + 1, \
             next_dispatch_at = $2, updated_at = NOW() \
         WHERE id = $1 AND state = 'dispatched' RETURNING attempts",
    )
    .bind(job_id)
    .bind(next_dispatch_at)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(r.try_get("attempts")?),
        None => Err(conflict_or_not_found(pool, job_id, JobState::Dispatched).await),
    }
}

/// Reclaim jobs stranded in `from` by a crashed peer: CAS back to `queued`
/// when `updated_at` predates `cutoff`, burning one attempt.
///
/// Only rows with attempts left are swept; dispatch never hands out a job
/// at the budget, so every `dispatched`/`processing` row qualifies. A live
/// worker that was merely slow sees its next heartbeat return `None` and
/// aborts without further transitions.
pub async fn requeue_stale(
    pool: &PgPool,
    from: JobState,
    cutoff: DateTime<Utc>,
    max_attempts: i32,
) -> Result<Vec<Uuid>, RegistryError> {
    if !JobState::can_transition(from, JobState::Queued) {
        return Err(RegistryError::IllegalTransition {
            from,
            to: JobState::Queued,
        });
    }

    let rows = sqlx::query(
        "UPDATE analysis_jobs \
         SET state = 'queued', attempts = attempts + 1, \
             next_dispatch_at = NOW(), updated_at = NOW() \
         WHERE state = $1 AND updated_at < $2 AND attempts < $3 \
         RETURNING id",
    )
    .bind(from.to_string())
    .bind(cutoff)
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| r.try_get("id"))
        .collect::<Result<_, _>>()
        .map_err(Into::into)
}

/// Queued jobs whose backoff window has passed, oldest first.
pub async fn find_dispatchable(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<AnalysisJob>, RegistryError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs \
         WHERE state = 'queued' AND next_dispatch_at <= NOW() \
         ORDER BY next_dispatch_at ASC LIMIT $1"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter()
        .map(job_from_row)
        .collect::<Result<_, _>>()
        .map_err(Into::into)
}

/// Number of jobs currently in `state` (queue-depth gauge).
pub async fn count_in_state(pool: &PgPool, state: JobState) -> Result<i64, RegistryError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM analysis_jobs WHERE state = $1")
        .bind(state.to_string())
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("n")?)
}

/// Flag an in-flight job for best-effort cancellation. Returns false when
/// the job is not currently `processing`.
pub async fn request_cancel(pool: &PgPool, job_id: Uuid) -> Result<bool, RegistryError> {
    let result = sqlx::query(
        "UPDATE analysis_jobs SET cancel_requested = TRUE, updated_at = NOW() \
         WHERE id = $1 AND state = 'processing'",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Heartbeat issued by the pipeline between frame batches: advances
/// `updated_at` and reports the cancellation flag. `None` means the job is
/// no longer `processing` (ownership was lost).
pub async fn poll_processing_heartbeat(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Option<bool>, RegistryError> {
    let row = sqlx::query(
        "UPDATE analysis_jobs SET updated_at = NOW() \
         WHERE id = $1 AND state = 'processing' RETURNING cancel_requested",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get("cancel_requested"))
        .transpose()
        .map_err(Into::into)
}
