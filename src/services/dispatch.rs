use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::db::queries::{self, RegistryError};
use crate::models::job::{AnalysisJob, FailureKind, JobState};

/// Consecutive failures before the circuit opens.
const CIRCUIT_THRESHOLD: u32 = 3;
/// How long an open circuit suppresses dispatch calls.
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(15);
/// Exponential backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Jobs considered per dispatch-loop tick.
const DISPATCH_BATCH: i64 = 10;
/// Slack past the dispatch timeout before a `dispatched` job counts as
/// stale (covers the processor-side claim window).
const DISPATCH_STALE_SLACK_SECS: i64 = 30;
/// Heartbeat silence after which a `processing` job is presumed lost.
/// Must exceed the worst-case gap between frame batches.
const PROCESSING_STALE_AFTER_SECS: i64 = 300;

/// Payload of the internal dispatch call.
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: Uuid,
    pub source_key: String,
}

/// Acknowledgment from the processing server.
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("processing server rejected job: {0}")]
    Rejected(String),
}

/// HTTP client for the processing server's internal dispatch interface.
pub struct DispatchClient {
    http: Client,
    base_url: String,
}

impl DispatchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Hand one job to the processing server. A timeout here means the
    /// dispatch failed, not the job: the claim CAS prevents double work if
    /// the server is actually processing.
    pub async fn dispatch(&self, job_id: Uuid, source_key: &str) -> Result<(), DispatchError> {
        let url = format!("{}/internal/v1/process", self.base_url);
        let request = DispatchRequest {
            job_id,
            source_key: source_key.to_string(),
        };

        let response = self.http.post(&url).json(&request).send().await?;
        let status = response.status();
        let ack: DispatchAck = response
            .json()
            .await
            .unwrap_or(DispatchAck {
                accepted: false,
                reason: Some(format!("unreadable ack (status {status})")),
            });

        if ack.accepted {
            Ok(())
        } else {
            Err(DispatchError::Rejected(
                ack.reason.unwrap_or_else(|| status.to_string()),
            ))
        }
    }

    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Explicit circuit-breaker state for the dispatch path. Owned by whoever
/// runs the retry loop and passed in, never a shared singleton.
#[derive(Debug, Default)]
pub struct DispatchHealth {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl DispatchHealth {
    /// Whether a dispatch call may be attempted right now.
    pub fn allows(&self, now: Instant) -> bool {
        match self.open_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= CIRCUIT_THRESHOLD {
            self.open_until = Some(now + CIRCUIT_COOLDOWN);
        }
    }
}

/// Exponential backoff for the nth attempt, capped.
pub fn backoff_delay(base_ms: u64, attempts: i32) -> Duration {
    let exponent = attempts.clamp(0, 16) as u32;
    let delay = Duration::from_millis(base_ms.saturating_mul(1u64 << exponent));
    delay.min(MAX_BACKOFF)
}

/// One best-effort dispatch attempt for a `Queued` job. Returns true when
/// the processing server accepted it. On failure the job is rolled back to
/// `Queued` with backoff, or marked `Failed(dispatch_exhausted)` once the
/// attempt budget is spent.
pub async fn attempt(
    pool: &PgPool,
    client: &DispatchClient,
    config: &AppConfig,
    health: &mut DispatchHealth,
    job: &AnalysisJob,
) -> bool {
    // A queued job can arrive here with its budget already spent (a retry at
    // the boundary re-queues at `attempts == max`). Fail it without
    // dispatching, so `attempts` never exceeds the configured maximum.
    if job.attempts >= config.max_attempts {
        let detail = format!("dispatch budget exhausted after {} attempts", job.attempts);
        match queries::fail_job(
            pool,
            job.id,
            JobState::Queued,
            FailureKind::DispatchExhausted,
            &detail,
        )
        .await
        {
            Ok(_) => {
                metrics::counter!("jobs_failed_total", "cause" => "dispatch_exhausted")
                    .increment(1);
                tracing::warn!(job_id = %job.id, attempts = job.attempts, "dispatch budget exhausted");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to mark job dispatch-exhausted");
            }
        }
        return false;
    }

    if !health.allows(Instant::now()) {
        tracing::debug!(job_id = %job.id, "dispatch circuit open, skipping attempt");
        return false;
    }

    // Optimistic transition; another dispatcher losing this CAS just skips.
    match queries::transition(pool, job.id, JobState::Queued, JobState::Dispatched).await {
        Ok(_) => {}
        Err(RegistryError::Conflict { actual, .. }) => {
            tracing::debug!(job_id = %job.id, state = %actual, "lost dispatch race");
            return false;
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "failed to mark job dispatched");
            return false;
        }
    }

    match client.dispatch(job.id, &job.source_key).await {
        Ok(()) => {
            health.record_success();
            metrics::counter!("dispatch_attempts_total", "outcome" => "accepted").increment(1);
            tracing::info!(job_id = %job.id, "job dispatched to processing server");
            true
        }
        Err(e) => {
            health.record_failure(Instant::now());
            metrics::counter!("dispatch_attempts_total", "outcome" => "failed").increment(1);
            tracing::warn!(job_id = %job.id, error = %e, "dispatch failed, rolling back to queued");

            let next_try = Utc::now()
                + chrono::Duration::from_std(backoff_delay(
                    config.dispatch_backoff_ms,
                    job.attempts + 1,
                ))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

            let attempts = match queries::requeue_after_dispatch_failure(pool, job.id, next_try)
                .await
            {
                Ok(attempts) => attempts,
                Err(err) => {
                    tracing::error!(job_id = %job.id, error = %err, "failed to requeue after dispatch failure");
                    return false;
                }
            };

            if attempts >= config.max_attempts {
                let detail = format!("dispatch failed after {attempts} attempts: {e}");
                match queries::fail_job(
                    pool,
                    job.id,
                    JobState::Queued,
                    FailureKind::DispatchExhausted,
                    &detail,
                )
                .await
                {
                    Ok(_) => {
                        metrics::counter!("jobs_failed_total", "cause" => "dispatch_exhausted")
                            .increment(1);
                        tracing::warn!(job_id = %job.id, attempts, "dispatch budget exhausted");
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, error = %err, "failed to mark job dispatch-exhausted");
                    }
                }
            }
            false
        }
    }
}

/// Background loop: re-attempts dispatch for queued jobs whose backoff
/// window has passed. Owns the circuit state for the lifetime of the loop.
pub async fn run_loop(state: AppState) {
    let mut health = DispatchHealth::default();
    let mut tick = tokio::time::interval(Duration::from_millis(state.config.dispatch_poll_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        target = %state.config.processing_server,
        "dispatch retry loop started"
    );

    loop {
        tick.tick().await;

        sweep_stale(&state).await;

        match queries::count_in_state(&state.db, JobState::Queued).await {
            Ok(depth) => metrics::gauge!("jobs_queued").set(depth as f64),
            Err(e) => tracing::error!(error = %e, "failed to read queue depth"),
        }

        let jobs = match queries::find_dispatchable(&state.db, DISPATCH_BATCH).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan dispatchable jobs");
                continue;
            }
        };

        for job in &jobs {
            attempt(&state.db, &state.dispatcher, &state.config, &mut health, job).await;
        }
    }
}

/// Reclaim jobs stranded mid-flight by a crashed peer: a processor that
/// acked and died before claiming leaves `dispatched`, a worker that died
/// mid-run leaves `processing` with a silent heartbeat. Both roll back to
/// `queued` for re-dispatch so no submitted job is silently dropped.
async fn sweep_stale(state: &AppState) {
    let now = Utc::now();
    let sweeps = [
        (
            JobState::Dispatched,
            now - chrono::Duration::seconds(
                state.config.dispatch_timeout_secs as i64 + DISPATCH_STALE_SLACK_SECS,
            ),
        ),
        (
            JobState::Processing,
            now - chrono::Duration::seconds(PROCESSING_STALE_AFTER_SECS),
        ),
    ];

    for (from, cutoff) in sweeps {
        match queries::requeue_stale(&state.db, from, cutoff, state.config.max_attempts).await {
            Ok(ids) if !ids.is_empty() => {
                metrics::counter!("stale_requeues_total", "from" => from.to_string())
                    .increment(ids.len() as u64);
                for id in &ids {
                    tracing::warn!(job_id = %id, from = %from, "re-queued stale job");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(from = %from, error = %e, "stale-job sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_delay(500, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(500, 30), MAX_BACKOFF);
        assert_eq!(backoff_delay(u64::MAX, 2), MAX_BACKOFF);
    }

    #[test]
    fn circuit_opens_after_threshold_and_cools_down() {
        let mut health = DispatchHealth::default();
        let now = Instant::now();
        assert!(health.allows(now));

        health.record_failure(now);
        health.record_failure(now);
        assert!(health.allows(now));

        health.record_failure(now);
        assert!(!health.allows(now));
        assert!(health.allows(now + CIRCUIT_COOLDOWN));

        health.record_success();
        assert!(health.allows(now));
    }

    #[test]
    fn ack_serialization_omits_missing_reason() {
        let ack = DispatchAck {
            accepted: true,
            reason: None,
        };
        assert_eq!(serde_json::to_string(&ack).unwrap(), r#"{"accepted":true}"#);

        let parsed: DispatchAck =
            serde_json::from_str(r#"{"accepted":false,"reason":"at capacity"}"#).unwrap();
        assert!(!parsed.accepted);
        assert_eq!(parsed.reason.as_deref(), Some("at capacity"));
    }
}
