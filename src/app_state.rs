use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{dispatch::DispatchClient, storage::AssetStore};

/// Shared state of the ingestion service. The inference client lives only
/// in the processor; ingestion talks to the processing server alone.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<AssetStore>,
    pub dispatcher: Arc<DispatchClient>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        store: AssetStore,
        dispatcher: DispatchClient,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            store: Arc::new(store),
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
        }
    }
}
