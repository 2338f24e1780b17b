use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vidmood::app_state::AppState;
use vidmood::config::AppConfig;
use vidmood::services::{
    dispatch::{self, DispatchClient},
    storage::AssetStore,
};
use vidmood::{db, routes};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing vidmood ingestion server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("videos_submitted_total", "Total videos accepted for analysis");
    metrics::describe_counter!(
        "dispatch_attempts_total",
        "Dispatch calls to the processing server, by outcome"
    );
    metrics::describe_counter!("jobs_completed_total", "Total analysis jobs completed");
    metrics::describe_counter!(
        "jobs_failed_total",
        "Total analysis jobs that failed, by cause"
    );
    metrics::describe_gauge!("jobs_queued", "Jobs currently waiting for dispatch");
    metrics::describe_counter!(
        "stale_requeues_total",
        "Jobs reclaimed from a crashed peer, by prior state"
    );
    metrics::describe_histogram!(
        "processing_seconds",
        "Time to process one video through the pipeline"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL job registry");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize the asset store
    tracing::info!(backend = %config.storage_backend, "Initializing asset store");
    let store = AssetStore::from_config(&config).expect("Failed to initialize asset store");

    // Initialize the processing-server dispatch client
    tracing::info!(target = %config.processing_server, "Initializing dispatch client");
    let dispatcher = DispatchClient::new(
        &config.processing_server,
        Duration::from_secs(config.dispatch_timeout_secs),
    )
    .expect("Failed to initialize dispatch client");

    let max_upload_bytes = config.max_upload_mb * 1024 * 1024;
    let bind_addr = config.bind_addr.clone();

    // Create shared application state
    let state = AppState::new(db_pool, store, dispatcher, config);

    // Background dispatch retry loop
    tokio::spawn(dispatch::run_loop(state.clone()));

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/videos",
            post(routes::videos::submit_video).get(routes::videos::list_videos),
        )
        .route("/api/v1/videos/{job_id}", get(routes::videos::get_status))
        .route(
            "/api/v1/videos/{job_id}/result",
            get(routes::videos::get_result),
        )
        .route(
            "/api/v1/videos/{job_id}/result/video",
            get(routes::videos::get_rendered_video),
        )
        .route(
            "/api/v1/videos/{job_id}/cancel",
            post(routes::videos::cancel_video),
        )
        .route(
            "/api/v1/videos/{job_id}/retry",
            post(routes::videos::retry_video),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes));

    tracing::info!("Starting vidmood on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
