use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a video analysis job.
///
/// Transitions are monotonic along
/// `Queued -> Dispatched -> Processing -> {Completed | Failed}`; the only
/// backward edges are the bounded retry (`Failed -> Queued`) and the rollback
/// of an optimistic dispatch (`Dispatched -> Queued`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Dispatched,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `from -> to` is a legal edge of the job state machine.
    pub fn can_transition(from: JobState, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (from, to),
            (Queued, Dispatched)
                | (Dispatched, Processing)
                | (Processing, Completed)
                | (Queued, Failed)
                | (Dispatched, Failed)
                | (Processing, Failed)
                | (Dispatched, Queued)
                | (Failed, Queued)
                | (Processing, Queued)
        )
    }
}

/// Structured cause recorded when a job ends up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Processing service unreachable beyond the retry budget.
    DispatchExhausted,
    /// Corrupt or undecodable video.
    Decode,
    /// The emotion classification capability failed.
    Inference,
    /// Asset store I/O failed while processing.
    Storage,
    /// Explicit client cancellation.
    Cancelled,
}

/// Failure cause attached to a `Failed` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub detail: String,
}

/// A video emotion-analysis job as persisted in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub state: JobState,
    /// Opaque storage handle for the raw upload.
    pub source_key: String,
    /// Storage handle for the emotion timeline, set once `Completed`.
    pub result_key: Option<String>,
    /// Storage handle for the optional annotated video.
    pub rendered_key: Option<String>,
    pub error: Option<JobError>,
    /// Dispatch/processing attempts, bounded by the configured maximum.
    pub attempts: i32,
    /// Per-job inference sampling override (frames per second).
    pub sample_fps: Option<f64>,
    /// Best-effort cancellation flag checked between frame batches.
    pub cancel_requested: bool,
    /// Earliest time the dispatch loop may re-attempt this job.
    pub next_dispatch_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
