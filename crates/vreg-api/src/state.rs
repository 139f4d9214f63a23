//! Application state

use metrics_exporter_prometheus::PrometheusHandle;
use vreg_core::JobQueue;
use vreg_db::Database;

/// Renders the Prometheus registry
pub type MetricsHandle = PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: JobQueue,
}

impl AppState {
    pub fn new(db: Database, queue: JobQueue) -> Self {
        Self { db, queue }
    }
}
