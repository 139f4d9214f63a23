//! API routes

mod health;
pub mod metrics;
mod stats;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::{AppState, MetricsHandle};

/// Create the main router
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let mut router = Router::new()
        .merge(health::routes())
        .merge(stats::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle));
    }

    router
}
