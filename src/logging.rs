//! Logging setup for pipeline hosts.
//!
//! The library only emits `tracing` events under the `pipewright` target;
//! binaries and tests opt into collection here.

use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// File/console logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "hourly", "daily", or anything else for a single file
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "pipewright.log".to_string(),
            rotation: "never".to_string(),
            log_level: "info".to_string(),
            use_json: false,
        }
    }
}

/// Install the global subscriber: rolling file plus console, or JSON file
/// only. Keep the returned guard alive for the lifetime of the host.
pub fn init_logging(config: &LogConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

static TEST_LOGGING: OnceCell<()> = OnceCell::new();

/// Idempotent console logging for tests; respects `RUST_LOG`.
pub fn init_test_logging() {
    TEST_LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_deserializes_with_defaults() {
        let config: LogConfig = serde_yaml::from_str("log_level: debug\nuse_json: true\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.use_json);
        assert_eq!(config.rotation, "never");
    }
}
