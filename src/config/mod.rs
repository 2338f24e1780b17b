use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Ingestion API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Processing server bind address.
    #[serde(default = "default_processor_bind_addr")]
    pub processor_bind_addr: String,

    /// PostgreSQL connection string for the job registry.
    pub database_url: String,

    /// Base URL of the processing server, e.g. "http://processor:3001".
    pub processing_server: String,

    /// Asset store backend: "local" or "s3".
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Root for raw uploads (local backend).
    #[serde(default = "default_uploaded_dir")]
    pub uploaded_videos_dir: String,

    /// Root for processed outputs (local backend).
    #[serde(default = "default_processed_dir")]
    pub processed_videos_dir: String,

    /// S3-compatible backend settings (required when STORAGE_BACKEND=s3).
    pub s3_bucket: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,

    /// Base URL of the emotion inference service.
    pub inference_url: String,

    /// Frames per inference call, caps decode-side memory.
    #[serde(default = "default_batch_size")]
    pub inference_batch_size: usize,

    /// Default frame sampling rate (frames per second).
    #[serde(default = "default_sample_fps")]
    pub sample_fps: f64,

    /// Maximum dispatch/processing attempts per job.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Timeout for one dispatch call to the processing server.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    /// Base delay for exponential dispatch backoff.
    #[serde(default = "default_dispatch_backoff_ms")]
    pub dispatch_backoff_ms: u64,

    /// Poll interval of the background dispatch loop.
    #[serde(default = "default_dispatch_poll_ms")]
    pub dispatch_poll_ms: u64,

    /// Concurrent pipeline slots on the processing server.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Upload size cap in megabytes.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Render an annotated copy of the video next to the timeline.
    #[serde(default)]
    pub render_annotated: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_processor_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_uploaded_dir() -> String {
    "/data/uploaded_videos".to_string()
}

fn default_processed_dir() -> String {
    "/data/processed_videos".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_sample_fps() -> f64 {
    4.0
}

fn default_max_attempts() -> i32 {
    3
}

fn default_dispatch_timeout_secs() -> u64 {
    10
}

fn default_dispatch_backoff_ms() -> u64 {
    500
}

fn default_dispatch_poll_ms() -> u64 {
    1000
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_max_upload_mb() -> usize {
    200
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
