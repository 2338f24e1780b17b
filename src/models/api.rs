use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{AnalysisJob, JobError, JobState};

/// Optional submission parameters carried alongside the video part.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitOptions {
    /// Inference sampling rate override in frames per second.
    #[garde(range(min = 0.5, max = 30.0))]
    pub sample_fps: Option<f64>,
}

/// Response after submitting a video for analysis.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: JobState,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub attempts: i32,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AnalysisJob> for JobStatusResponse {
    fn from(job: AnalysisJob) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            attempts: job.attempts,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Body returned by the result endpoint while the job is still in flight.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub job_id: Uuid,
    pub state: JobState,
}
