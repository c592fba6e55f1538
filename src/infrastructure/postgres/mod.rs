//! PostgreSQL connectivity for the relational queue backends.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
