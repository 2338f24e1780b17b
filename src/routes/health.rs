use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub storage: ComponentHealth,
    pub processing_server: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(started: std::time::Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health — dependency status for the ingestion service.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_start = std::time::Instant::now();
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth::ok(db_start),
        Err(_) => ComponentHealth::error(),
    };

    let store_start = std::time::Instant::now();
    let storage = match state.store.health_check().await {
        Ok(_) => ComponentHealth::ok(store_start),
        Err(_) => ComponentHealth::error(),
    };

    // The processing server being down degrades dispatch, not ingestion;
    // uploads still queue. Report it without failing the endpoint.
    let proc_start = std::time::Instant::now();
    let processing_server = if state.dispatcher.health_check().await {
        ComponentHealth::ok(proc_start)
    } else {
        ComponentHealth::error()
    };

    let all_healthy = database.is_ok() && storage.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy && processing_server.is_ok() {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            storage,
            processing_server,
        },
    };

    (status_code, Json(response))
}
