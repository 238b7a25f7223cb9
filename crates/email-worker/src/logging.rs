//! Logging setup.
//!
//! The worker is a log producer only: it calls [`init`] once at startup and
//! uses `tracing` macros everywhere else. `RUST_LOG` overrides the default
//! level.

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output format for log lines on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, attached to every line.
    pub service_name: String,

    /// Default level filter, overridden by `RUST_LOG`.
    pub default_level: String,

    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "email-worker".into(),
            default_level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

impl LogConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }
}

/// Install the global subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init(config: LogConfig) {
    let filter = config.env_filter();

    let layer = match config.format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();

    tracing::info!(
        service = %config.service_name,
        format = ?config.format,
        "logging initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "email-worker");
        assert_eq!(config.default_level, "info");
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parses_from_cli_value() {
        assert_eq!(LogFormat::from_str("json", true).unwrap(), LogFormat::Json);
        assert_eq!(
            LogFormat::from_str("compact", true).unwrap(),
            LogFormat::Compact
        );
        assert!(LogFormat::from_str("xml", true).is_err());
    }
}
