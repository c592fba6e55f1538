use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::queue::{BackoffConfig, OrphanAction, OrphanSweeperConfig, QueueConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub orphan: OrphanSettings,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Admin API key expected in `X-API-Key`; unset disables the check
    pub key: Option<String>,
}

/// Storage substrate behind the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    #[default]
    Memory,
    Postgres,
    PostgresLessLocking,
    Redis,
}

impl QueueBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackendKind::Memory => "memory",
            QueueBackendKind::Postgres => "postgres",
            QueueBackendKind::PostgresLessLocking => "postgres_less_locking",
            QueueBackendKind::Redis => "redis",
        }
    }

    pub fn needs_postgres(&self) -> bool {
        matches!(
            self,
            QueueBackendKind::Postgres | QueueBackendKind::PostgresLessLocking
        )
    }

    pub fn needs_redis(&self) -> bool {
        matches!(self, QueueBackendKind::Redis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub backend: QueueBackendKind,
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_ephemeral_table_name")]
    pub ephemeral_table_name: String,
    /// Restrict the less-locking table to rows of this queue's name
    #[serde(default)]
    pub scope_by_name: bool,
    #[serde(default = "default_true")]
    pub fifo: bool,
    #[serde(default = "default_true")]
    pub ephemeral_enabled: bool,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub ephemeral_max_size: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrphanSettings {
    /// Run the periodic sweeper
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_orphan_threshold_ms")]
    pub threshold_ms: u64,
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_report_capacity")]
    pub report_capacity: usize,
    #[serde(default)]
    pub action: OrphanAction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout_seconds")]
    pub circuit_breaker_reset_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_table_name() -> String {
    "queue".to_string()
}

fn default_ephemeral_table_name() -> String {
    "queue_ephemeral".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    10
}

fn default_retry_max_delay_ms() -> u64 {
    1_000
}

fn default_redis_prefix() -> String {
    "rq".to_string()
}

fn default_orphan_threshold_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_scan_interval_seconds() -> u64 {
    60
}

fn default_report_capacity() -> usize {
    16
}

fn default_database_url() -> String {
    "postgres://localhost:5432/reliable_queue".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout_seconds() -> u32 {
    5
}

fn default_idle_timeout_seconds() -> u32 {
    600
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "reliable-queue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    /// Load settings: defaults, then `config/default`, then `config/{RUN_MODE}`,
    /// then `APP__`-prefixed environment variables (`APP__QUEUE__BACKEND=redis`).
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("queue.backend", "memory")?
            .set_default("queue.name", default_queue_name())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl QueueSettings {
    /// Engine configuration for these settings.
    pub fn queue_config(&self, orphan: &OrphanSettings) -> QueueConfig {
        QueueConfig {
            name: self.name.clone(),
            fifo: self.fifo,
            ephemeral_enabled: self.ephemeral_enabled,
            max_size: self.max_size,
            ephemeral_max_size: self.ephemeral_max_size,
            max_retries: self.max_retries,
            backoff: BackoffConfig {
                initial_delay_ms: self.retry_initial_delay_ms,
                max_delay_ms: self.retry_max_delay_ms,
                ..BackoffConfig::default()
            },
            orphan_threshold: orphan.threshold(),
        }
    }
}

impl OrphanSettings {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn sweeper_config(&self) -> OrphanSweeperConfig {
        OrphanSweeperConfig {
            interval: Duration::from_secs(self.scan_interval_seconds.max(1)),
            threshold: self.threshold(),
            channel_capacity: self.report_capacity,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::default(),
            name: default_queue_name(),
            table_name: default_table_name(),
            ephemeral_table_name: default_ephemeral_table_name(),
            scope_by_name: false,
            fifo: true,
            ephemeral_enabled: true,
            max_size: None,
            ephemeral_max_size: None,
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            redis_prefix: default_redis_prefix(),
        }
    }
}

impl Default for OrphanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: default_orphan_threshold_ms(),
            scan_interval_seconds: default_scan_interval_seconds(),
            report_capacity: default_report_capacity(),
            action: OrphanAction::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
