//! Cache statistics endpoint

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use vreg_db::CacheStats;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub pending_jobs: usize,
}

/// GET /stats
async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let cache = state.db.get_cache_stats().await?;
    Ok(Json(StatsResponse {
        cache,
        pending_jobs: state.queue.pending(),
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", get(stats))
}
