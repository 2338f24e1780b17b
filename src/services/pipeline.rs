use std::time::{Duration, Instant};

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::queries::{self, RegistryError};
use crate::models::emotion::{EmotionRecord, EmotionTimeline};
use crate::models::job::{AnalysisJob, FailureKind, JobState};
use crate::services::decode::{self, DecodeError, Frame, FrameStream};
use crate::services::inference::{EmotionClassifier, InferenceError};
use crate::services::storage::{AssetKind, AssetStore, StorageError};

/// How many times the claim retries while the ingestion side is still
/// flipping the job from Queued to Dispatched (the ack races the CAS).
const CLAIM_RETRIES: u32 = 10;
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How one pipeline run ended. Domain failures are recorded on the job and
/// reported here; only registry outages bubble as errors.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// Another worker claimed the job first; dispatch is idempotent.
    LostClaim,
    Cancelled,
    Failed(FailureKind),
}

/// A failure to be recorded on the job as its structured cause.
#[derive(Debug)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl From<DecodeError> for JobFailure {
    fn from(e: DecodeError) -> Self {
        Self {
            kind: FailureKind::Decode,
            detail: e.to_string(),
        }
    }
}

impl From<InferenceError> for JobFailure {
    fn from(e: InferenceError) -> Self {
        Self {
            kind: FailureKind::Inference,
            detail: e.to_string(),
        }
    }
}

impl From<StorageError> for JobFailure {
    fn from(e: StorageError) -> Self {
        Self {
            kind: FailureKind::Storage,
            detail: e.to_string(),
        }
    }
}

enum Abort {
    Cancelled,
    /// The job left `processing` under us; stop without transitions.
    LostOwnership,
    Failure(JobFailure),
    /// Registry outage; bubbles out instead of being recorded on the job.
    Registry(RegistryError),
}

impl From<JobFailure> for Abort {
    fn from(f: JobFailure) -> Self {
        Abort::Failure(f)
    }
}

impl From<DecodeError> for Abort {
    fn from(e: DecodeError) -> Self {
        Abort::Failure(e.into())
    }
}

impl From<InferenceError> for Abort {
    fn from(e: InferenceError) -> Self {
        Abort::Failure(e.into())
    }
}

impl From<StorageError> for Abort {
    fn from(e: StorageError) -> Self {
        Abort::Failure(e.into())
    }
}

impl From<RegistryError> for Abort {
    fn from(e: RegistryError) -> Self {
        Abort::Registry(e)
    }
}

struct AnalysisOutput {
    result_key: String,
    rendered_key: Option<String>,
}

/// Run the full pipeline for one dispatched job: claim, decode, infer,
/// assemble, complete. Failures in the middle steps become a structured
/// cause on the job; `attempts` is left to the caller's retry policy.
pub async fn process_job<C: EmotionClassifier>(
    pool: &PgPool,
    store: &AssetStore,
    classifier: &C,
    config: &AppConfig,
    job_id: Uuid,
) -> Result<PipelineOutcome, RegistryError> {
    let Some(job) = claim(pool, job_id).await? else {
        return Ok(PipelineOutcome::LostClaim);
    };

    tracing::info!(job_id = %job.id, source_key = %job.source_key, "claimed job for processing");
    let started = Instant::now();

    let outcome = match analyze(pool, store, classifier, config, &job).await {
        Ok(output) => {
            match queries::complete_job(
                pool,
                job.id,
                &output.result_key,
                output.rendered_key.as_deref(),
            )
            .await
            {
                Ok(_) => {
                    metrics::counter!("jobs_completed_total").increment(1);
                    tracing::info!(
                        job_id = %job.id,
                        result_key = %output.result_key,
                        elapsed_ms = started.elapsed().as_millis(),
                        "job completed"
                    );
                    PipelineOutcome::Completed
                }
                Err(RegistryError::Conflict { actual, .. }) => {
                    tracing::warn!(job_id = %job.id, state = %actual, "completion lost to concurrent transition, releasing outputs");
                    release_outputs(store, &output).await;
                    PipelineOutcome::LostClaim
                }
                Err(e) => {
                    release_outputs(store, &output).await;
                    return Err(e);
                }
            }
        }
        Err(Abort::Cancelled) => {
            record_failure(pool, job.id, FailureKind::Cancelled, "cancelled by client").await;
            tracing::info!(job_id = %job.id, "job cancelled between frame batches");
            PipelineOutcome::Cancelled
        }
        Err(Abort::LostOwnership) => {
            tracing::warn!(job_id = %job.id, "job left processing state mid-run, aborting");
            PipelineOutcome::LostClaim
        }
        Err(Abort::Failure(failure)) => {
            tracing::error!(
                job_id = %job.id,
                kind = %failure.kind,
                detail = %failure.detail,
                "job processing failed"
            );
            record_failure(pool, job.id, failure.kind, &failure.detail).await;
            PipelineOutcome::Failed(failure.kind)
        }
        Err(Abort::Registry(e)) => return Err(e),
    };

    metrics::histogram!("processing_seconds").record(started.elapsed().as_secs_f64());
    Ok(outcome)
}

/// Claim ownership via CAS Dispatched -> Processing. `None` means another
/// worker won or the job is gone; both are a silent no-op for this worker.
async fn claim(pool: &PgPool, job_id: Uuid) -> Result<Option<AnalysisJob>, RegistryError> {
    for _ in 0..CLAIM_RETRIES {
        match queries::transition(pool, job_id, JobState::Dispatched, JobState::Processing).await
        {
            Ok(job) => return Ok(Some(job)),
            Err(RegistryError::Conflict {
                actual: JobState::Queued,
                ..
            }) => {
                // Dispatch ack raced the Queued->Dispatched transition.
                tokio::time::sleep(CLAIM_RETRY_DELAY).await;
            }
            Err(RegistryError::Conflict { actual, .. }) => {
                tracing::debug!(job_id = %job_id, state = %actual, "claim race lost");
                metrics::counter!("claim_conflicts_total").increment(1);
                return Ok(None);
            }
            Err(RegistryError::NotFound { .. }) => {
                tracing::warn!(job_id = %job_id, "dispatched job vanished before claim");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    tracing::warn!(job_id = %job_id, "job never reached dispatched state, giving up claim");
    Ok(None)
}

async fn analyze<C: EmotionClassifier>(
    pool: &PgPool,
    store: &AssetStore,
    classifier: &C,
    config: &AppConfig,
    job: &AnalysisJob,
) -> Result<AnalysisOutput, Abort> {
    let raw = store.get(AssetKind::Raw, &job.source_key).await?;

    // ffmpeg wants a file path; stage the asset in a scratch dir.
    let scratch = tempfile::Builder::new()
        .prefix("vidmood-")
        .tempdir()
        .map_err(StorageError::Io)?;
    let ext = job.source_key.rsplit('.').next().unwrap_or("bin");
    let input_path = scratch.path().join(format!("input.{ext}"));
    tokio::fs::write(&input_path, &raw)
        .await
        .map_err(StorageError::Io)?;
    drop(raw);

    let info = decode::probe_video(&input_path).await?;
    let sample_fps = job.sample_fps.unwrap_or(config.sample_fps);
    tracing::debug!(
        job_id = %job.id,
        duration = info.duration,
        width = info.width,
        height = info.height,
        sample_fps,
        "decoding video"
    );

    let mut stream = FrameStream::open(&input_path, sample_fps).await?;
    let mut records: Vec<EmotionRecord> = Vec::new();

    loop {
        let batch = collect_batch(&mut stream, config.inference_batch_size).await?;
        if batch.is_empty() {
            break;
        }

        // Cancellation is checked between batches; this also advances the
        // job's updated_at so a stuck pipeline is observable.
        match queries::poll_processing_heartbeat(pool, job.id).await? {
            None => return Err(Abort::LostOwnership),
            Some(true) => return Err(Abort::Cancelled),
            Some(false) => {}
        }

        metrics::counter!("frames_analyzed_total").increment(batch.len() as u64);
        records.extend(classify_batch_records(classifier, &batch).await?);
    }

    if records.is_empty() {
        return Err(Abort::Failure(JobFailure {
            kind: FailureKind::Decode,
            detail: "no frames decoded from source video".to_string(),
        }));
    }

    let timeline = EmotionTimeline {
        duration: info.duration,
        sample_fps,
        records,
    };

    let result_key = AssetKind::Timeline.key(job.id, "json");
    let timeline_bytes = serde_json::to_vec(&timeline).map_err(|e| {
        Abort::Failure(JobFailure {
            kind: FailureKind::Storage,
            detail: format!("timeline serialization failed: {e}"),
        })
    })?;
    store.put(AssetKind::Timeline, &result_key, &timeline_bytes).await?;

    let rendered_key = if config.render_annotated {
        match render_annotated_asset(store, job.id, &input_path, &timeline, scratch.path()).await
        {
            Ok(key) => Some(key),
            Err(failure) => {
                // Release the timeline so a failed job leaves no outputs.
                let _ = store.delete(AssetKind::Timeline, &result_key).await;
                return Err(Abort::Failure(failure));
            }
        }
    } else {
        None
    };

    Ok(AnalysisOutput {
        result_key,
        rendered_key,
    })
}

async fn render_annotated_asset(
    store: &AssetStore,
    job_id: Uuid,
    input_path: &std::path::Path,
    timeline: &EmotionTimeline,
    scratch: &std::path::Path,
) -> Result<String, JobFailure> {
    let annotated_path = scratch.join("annotated.mp4");
    decode::render_annotated(input_path, timeline, &annotated_path).await?;
    let bytes = tokio::fs::read(&annotated_path)
        .await
        .map_err(|e| JobFailure::from(StorageError::Io(e)))?;

    let key = AssetKind::Rendered.key(job_id, "mp4");
    store.put(AssetKind::Rendered, &key, &bytes).await?;
    Ok(key)
}

/// Pull up to `batch_size` frames off the stream.
pub(crate) async fn collect_batch(
    stream: &mut FrameStream,
    batch_size: usize,
) -> Result<Vec<Frame>, DecodeError> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        match stream.next_frame().await? {
            Some(frame) => batch.push(frame),
            None => break,
        }
    }
    Ok(batch)
}

/// Classify one batch, pairing each prediction with its frame's offset.
pub(crate) async fn classify_batch_records<C: EmotionClassifier>(
    classifier: &C,
    batch: &[Frame],
) -> Result<Vec<EmotionRecord>, JobFailure> {
    let mut jpegs = Vec::with_capacity(batch.len());
    for frame in batch {
        jpegs.push(frame.to_jpeg()?);
    }

    let predictions = classifier.classify_batch(&jpegs).await?;
    Ok(batch
        .iter()
        .zip(predictions)
        .map(|(frame, scores)| EmotionRecord {
            timestamp: frame.timestamp,
            scores,
        })
        .collect())
}

async fn record_failure(pool: &PgPool, job_id: Uuid, kind: FailureKind, detail: &str) {
    metrics::counter!("jobs_failed_total", "cause" => kind.to_string()).increment(1);
    if let Err(e) = queries::fail_job(pool, job_id, JobState::Processing, kind, detail).await {
        tracing::error!(job_id = %job_id, error = %e, "failed to record job failure");
    }
}

async fn release_outputs(store: &AssetStore, output: &AnalysisOutput) {
    if let Err(e) = store.delete(AssetKind::Timeline, &output.result_key).await {
        tracing::warn!(error = %e, "failed to release timeline asset");
    }
    if let Some(key) = &output.rendered_key {
        if let Err(e) = store.delete(AssetKind::Rendered, key).await {
            tracing::warn!(error = %e, "failed to release rendered asset");
        }
    }
}
