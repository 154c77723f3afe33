use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::models::tier::ServiceTier;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub tier: ServiceTier,
    pub active_jobs: usize,
    pub tracked_jobs: usize,
}

/// GET /health — liveness plus job counts.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.processor.store();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tier: state.processor.config().tier,
        active_jobs: store.active_count(),
        tracked_jobs: store.len(),
    })
}
