// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::circuit_breaker;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;
pub use infrastructure::redis;

// Queue engine and storage backends
pub mod queue;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
