use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, routing::post, Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vidmood::config::AppConfig;
use vidmood::db;
use vidmood::routes::metrics::prometheus_metrics;
use vidmood::services::dispatch::{DispatchAck, DispatchRequest};
use vidmood::services::inference::HttpEmotionClassifier;
use vidmood::services::pipeline::{self, PipelineOutcome};
use vidmood::services::storage::AssetStore;

/// Shared state of the processing server. Pipeline slots are a semaphore so
/// dispatch is rejected (and retried by the ingestion side) instead of
/// queueing unboundedly here.
#[derive(Clone)]
struct ProcessorState {
    db: PgPool,
    store: Arc<AssetStore>,
    classifier: Arc<HttpEmotionClassifier>,
    config: Arc<AppConfig>,
    slots: Arc<Semaphore>,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Initializing vidmood processing server"
    );

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("frames_analyzed_total", "Frames classified by the pipeline");
    metrics::describe_counter!("jobs_completed_total", "Total analysis jobs completed");
    metrics::describe_counter!(
        "jobs_failed_total",
        "Total analysis jobs that failed, by cause"
    );
    metrics::describe_counter!(
        "claim_conflicts_total",
        "Claims lost to a concurrent worker"
    );
    metrics::describe_histogram!(
        "processing_seconds",
        "Time to process one video through the pipeline"
    );

    tracing::info!("Connecting to PostgreSQL job registry");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!(backend = %config.storage_backend, "Initializing asset store");
    let store = AssetStore::from_config(&config).expect("Failed to initialize asset store");

    tracing::info!(target = %config.inference_url, "Initializing inference client");
    let classifier = HttpEmotionClassifier::new(
        &config.inference_url,
        Duration::from_secs(config.dispatch_timeout_secs),
    )
    .expect("Failed to initialize inference client");

    let bind_addr = config.processor_bind_addr.clone();
    let state = ProcessorState {
        db: db_pool,
        store: Arc::new(store),
        classifier: Arc::new(classifier),
        slots: Arc::new(Semaphore::new(config.worker_concurrency)),
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/internal/v1/process", post(accept_job))
        .route("/health", get(health_check))
        .with_state(state)
        .route(
            "/metrics",
            get(prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting processor on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

/// POST /internal/v1/process — accept one dispatched job.
///
/// Acceptance only means a pipeline slot was reserved; the ingestion side's
/// backoff handles rejections, and the claim CAS handles duplicates.
async fn accept_job(
    State(state): State<ProcessorState>,
    Json(request): Json<DispatchRequest>,
) -> (StatusCode, Json<DispatchAck>) {
    let permit = match state.slots.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!(job_id = %request.job_id, "rejecting dispatch, all pipeline slots busy");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(DispatchAck {
                    accepted: false,
                    reason: Some("at capacity".to_string()),
                }),
            );
        }
    };

    tracing::info!(
        job_id = %request.job_id,
        source_key = %request.source_key,
        "dispatch accepted"
    );

    tokio::spawn(async move {
        let _permit = permit;
        let outcome = pipeline::process_job(
            &state.db,
            &state.store,
            state.classifier.as_ref(),
            &state.config,
            request.job_id,
        )
        .await;

        match outcome {
            Ok(PipelineOutcome::Completed) => {}
            Ok(PipelineOutcome::LostClaim) => {
                tracing::debug!(job_id = %request.job_id, "job was claimed elsewhere");
            }
            Ok(PipelineOutcome::Cancelled) => {
                tracing::info!(job_id = %request.job_id, "job cancelled");
            }
            Ok(PipelineOutcome::Failed(kind)) => {
                tracing::warn!(job_id = %request.job_id, kind = %kind, "job failed");
            }
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "registry error during processing");
            }
        }
    });

    (
        StatusCode::OK,
        Json(DispatchAck {
            accepted: true,
            reason: None,
        }),
    )
}

/// GET /health — dependency status for the processing server.
async fn health_check(State(state): State<ProcessorState>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let store_ok = state.store.health_check().await.is_ok();
    let inference_ok = state.classifier.health_check().await;

    let healthy = db_ok && store_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy && inference_ok { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "checks": {
                "database": db_ok,
                "storage": store_ok,
                "inference": inference_ok,
            },
            "idle_slots": state.slots.available_permits(),
        })),
    )
}
