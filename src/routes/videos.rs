use std::str::FromStr;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries::{self, RegistryError};
use crate::models::api::{JobStatusResponse, PendingResponse, SubmitOptions, SubmitResponse};
use crate::models::emotion::EmotionTimeline;
use crate::models::job::{FailureKind, JobState};
use crate::routes::ApiError;
use crate::services::dispatch::{self, DispatchHealth};
use crate::services::storage::{AssetKind, StorageError};
use crate::services::validation;

/// A completed job's recorded assets must exist; a missing or unreadable
/// asset is registry/storage inconsistency, not a client error.
fn completed_asset_error(job_id: Uuid, e: StorageError) -> ApiError {
    tracing::error!(job_id = %job_id, error = %e, "completed job's asset is missing or unreadable");
    ApiError::Internal
}

/// POST /api/v1/videos — upload a video and register an analysis job.
///
/// Multipart form: a `video` file part plus optional `sample_fps` text part.
/// The upload is validated and persisted synchronously; everything after the
/// 202 is asynchronous.
pub async fn submit_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut video_data: Option<Vec<u8>> = None;
    let mut options = SubmitOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("video") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read video part: {e}")))?;
                video_data = Some(data.to_vec());
            }
            Some("sample_fps") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read sample_fps: {e}")))?;
                let fps: f64 = text
                    .parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid sample_fps: {text}")))?;
                options.sample_fps = Some(fps);
            }
            _ => {}
        }
    }

    let video_data = video_data
        .ok_or_else(|| ApiError::BadRequest("missing required 'video' part".to_string()))?;

    options
        .validate()
        .map_err(|report| ApiError::BadRequest(report.to_string()))?;

    let format = validation::sniff_container(&video_data).ok_or_else(|| {
        ApiError::UnsupportedMedia("payload is not a recognized video container".to_string())
    })?;

    // The id doubles as the storage key stem, so allocate it before the row.
    let job_id = Uuid::new_v4();
    let source_key = AssetKind::Raw.key(job_id, format.ext);

    state
        .store
        .put(AssetKind::Raw, &source_key, &video_data)
        .await?;
    drop(video_data);

    let job = match queries::create_job(&state.db, job_id, &source_key, options.sample_fps).await {
        Ok(job) => job,
        Err(e) => {
            // Don't leave an orphaned upload behind a failed insert.
            let _ = state.store.delete(AssetKind::Raw, &source_key).await;
            return Err(e.into());
        }
    };

    metrics::counter!("videos_submitted_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        source_key = %source_key,
        format = format.mime,
        sample_fps = options.sample_fps,
        "video submitted"
    );

    // First dispatch attempt happens out of band; the retry loop picks the
    // job up if this one fails.
    let dispatch_state = state.clone();
    let dispatch_job = job.clone();
    tokio::spawn(async move {
        let mut health = DispatchHealth::default();
        dispatch::attempt(
            &dispatch_state.db,
            &dispatch_state.dispatcher,
            &dispatch_state.config,
            &mut health,
            &dispatch_job,
        )
        .await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            state: job.state,
        }),
    ))
}

/// GET /api/v1/videos/{job_id} — job status.
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(job.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub state: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/v1/videos — list jobs, optionally filtered by state.
pub async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobStatusResponse>>, ApiError> {
    let filter = params
        .state
        .as_deref()
        .map(|s| {
            JobState::from_str(s).map_err(|_| ApiError::BadRequest(format!("unknown state: {s}")))
        })
        .transpose()?;
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let jobs = queries::list_jobs(&state.db, filter, limit).await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

/// GET /api/v1/videos/{job_id}/result — the emotion timeline.
///
/// 202 while the job is in flight, 409 with the failure cause once failed,
/// 200 with the timeline JSON once completed.
pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    match job.state {
        JobState::Completed => {
            let result_key = job.result_key.as_deref().ok_or(ApiError::Internal)?;
            let bytes = state
                .store
                .get(AssetKind::Timeline, result_key)
                .await
                .map_err(|e| completed_asset_error(job.id, e))?;
            let timeline: EmotionTimeline = serde_json::from_slice(&bytes).map_err(|e| {
                tracing::error!(job_id = %job.id, error = %e, "stored timeline is unreadable");
                ApiError::Internal
            })?;
            Ok(Json(timeline).into_response())
        }
        JobState::Failed => {
            let detail = job
                .error
                .map(|e| format!("{}: {}", e.kind, e.detail))
                .unwrap_or_else(|| "job failed".to_string());
            Err(ApiError::Conflict(detail))
        }
        _ => Ok((
            StatusCode::ACCEPTED,
            Json(PendingResponse {
                job_id: job.id,
                state: job.state,
            }),
        )
            .into_response()),
    }
}

/// GET /api/v1/videos/{job_id}/result/video — the annotated video, when the
/// job was processed with rendering enabled.
pub async fn get_rendered_video(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if job.state != JobState::Completed {
        return Err(ApiError::NotFound);
    }
    let rendered_key = job.rendered_key.as_deref().ok_or(ApiError::NotFound)?;

    let stream = state
        .store
        .get_stream(AssetKind::Rendered, rendered_key)
        .await
        .map_err(|e| completed_asset_error(job.id, e))?;
    Ok((
        [(header::CONTENT_TYPE, "video/mp4")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// POST /api/v1/videos/{job_id}/cancel — cancel a job.
///
/// Jobs not yet processing fail immediately; an in-flight job is flagged and
/// stops at the next frame-batch boundary.
pub async fn cancel_video(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    match job.state {
        JobState::Queued | JobState::Dispatched => {
            let cancelled = queries::fail_job(
                &state.db,
                job_id,
                job.state,
                FailureKind::Cancelled,
                "cancelled before processing",
            )
            .await?;
            tracing::info!(job_id = %job_id, "job cancelled before processing");
            Ok(Json(JobStatusResponse::from(cancelled)).into_response())
        }
        JobState::Processing => {
            if queries::request_cancel(&state.db, job_id).await? {
                tracing::info!(job_id = %job_id, "cancellation requested for in-flight job");
                Ok((
                    StatusCode::ACCEPTED,
                    Json(PendingResponse {
                        job_id,
                        state: JobState::Processing,
                    }),
                )
                    .into_response())
            } else {
                // Raced a terminal transition; report the fresh state.
                Err(ApiError::Conflict(
                    "job is no longer processing".to_string(),
                ))
            }
        }
        JobState::Completed | JobState::Failed => Err(ApiError::Conflict(format!(
            "job is already {}",
            job.state
        ))),
    }
}

/// POST /api/v1/videos/{job_id}/retry — re-queue a failed job.
pub async fn retry_video(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = queries::retry_job(&state.db, job_id, state.config.max_attempts)
        .await
        .map_err(|e| match e {
            RegistryError::RetryExhausted { .. } => {
                ApiError::Conflict("retry budget exhausted".to_string())
            }
            other => other.into(),
        })?;

    tracing::info!(job_id = %job_id, attempts = job.attempts, "job re-queued for retry");
    Ok(Json(job.into()))
}
