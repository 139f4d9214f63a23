//! vreg operational HTTP API
//!
//! Health, cache statistics and the Prometheus scrape endpoint.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
