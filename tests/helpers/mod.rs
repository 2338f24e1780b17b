//! Test helper utilities for E2E testing

use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/v1/videos
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: String,
}

/// Response from GET /api/v1/videos/{job_id}
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub state: String,
    pub attempts: i32,
    pub error: Option<JobErrorBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobErrorBody {
    pub kind: String,
    pub detail: String,
}

/// One record of the emotion timeline returned by the result endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct EmotionRecord {
    pub timestamp: f64,
    pub scores: std::collections::BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmotionTimeline {
    pub duration: f64,
    pub sample_fps: f64,
    pub records: Vec<EmotionRecord>,
}

/// Generate a synthetic test video with ffmpeg's testsrc pattern.
pub fn generate_test_video(
    path: &Path,
    duration_secs: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = std::process::Command::new("ffmpeg")
        .args([
            "-y",
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            &format!("testsrc=duration={duration_secs}:size=320x240:rate=15"),
            "-pix_fmt",
            "yuv420p",
        ])
        .arg(path)
        .status()?;

    if !status.success() {
        return Err(format!("ffmpeg fixture generation failed: {status}").into());
    }
    Ok(())
}

/// Upload a video to the submission endpoint.
pub async fn upload_video(
    client: &reqwest::Client,
    base_url: &str,
    video_path: &Path,
    sample_fps: Option<f64>,
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let video_bytes = std::fs::read(video_path)?;
    let filename = video_path.file_name().unwrap().to_str().unwrap();

    let mut form = multipart::Form::new().part(
        "video",
        multipart::Part::bytes(video_bytes)
            .file_name(filename.to_string())
            .mime_str("video/mp4")?,
    );

    if let Some(fps) = sample_fps {
        form = form.text("sample_fps", fps.to_string());
    }

    let response = client
        .post(format!("{}/api/v1/videos", base_url))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    let body = response.json::<SubmitResponse>().await?;
    Ok(body)
}

/// Poll job status until completed or failed (with timeout).
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/videos/{}", base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status_response = response.json::<JobStatusResponse>().await?;

        match status_response.state.as_str() {
            "completed" | "failed" => return Ok(status_response),
            "queued" | "dispatched" | "processing" => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            _ => {
                return Err(format!("Unknown job state: {}", status_response.state).into());
            }
        }
    }

    Err(format!("Job did not complete within {} seconds", timeout_secs).into())
}

/// Fetch the emotion timeline for a completed job.
pub async fn fetch_timeline(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &Uuid,
) -> Result<EmotionTimeline, Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/v1/videos/{}/result", base_url, job_id))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Result fetch failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<EmotionTimeline>().await?)
}

/// Sanity-check a timeline against the properties every completed job must
/// satisfy: ordered timestamps, bounded scores, coverage of the duration.
pub fn assert_timeline_well_formed(timeline: &EmotionTimeline) {
    assert!(
        !timeline.records.is_empty(),
        "completed job must have at least one record"
    );

    for pair in timeline.records.windows(2) {
        assert!(
            pair[0].timestamp <= pair[1].timestamp,
            "timestamps must be non-decreasing: {} > {}",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }

    for record in &timeline.records {
        assert!(
            record.timestamp >= 0.0 && record.timestamp <= timeline.duration + 1.0,
            "timestamp {} outside video duration {}",
            record.timestamp,
            timeline.duration
        );
        for (label, score) in &record.scores {
            assert!(
                (0.0..=1.0).contains(score),
                "score for {} out of range: {}",
                label,
                score
            );
        }
    }
}
