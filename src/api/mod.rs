//! Admin HTTP endpoints.

mod handlers;
mod health;
mod metrics;
mod routes;

pub use handlers::{list_orphans, queue_stats, recover_orphans};
pub use health::health;
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
