mod settings;

pub use settings::{
    ApiConfig, DatabaseConfig, LoggingConfig, OrphanSettings, OtelConfig, QueueBackendKind,
    QueueSettings, RedisConfig, ServerConfig, Settings,
};
