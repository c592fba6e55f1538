//! Infrastructure layer modules
//!
//! - `circuit_breaker`: fail-fast guard shared by the storage pools
//! - `config`: Application configuration and settings
//! - `error`: HTTP-facing error type
//! - `metrics`: Prometheus collectors for queue engines
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool and health tracking

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
