//! Logging initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! human-readable or a JSON formatting layer. `RUST_LOG` always takes
//! precedence over the configured level.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// One JSON object per line, with span context
    Json,
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level name: trace, debug, info, warn, error or fatal
    pub log_level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Map a level name to a tracing filter level.
///
/// `fatal` has no tracing equivalent and maps to `error`; unknown names fall
/// back to `info`.
pub fn level_directive(log_level: &str) -> &'static str {
    match log_level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}

/// Build the default filter for a level: our crates at `level`, noisy
/// client libraries capped at `warn`.
pub fn default_filter(log_level: &str) -> String {
    let level = level_directive(log_level);
    format!("{level},kube=warn,tower=warn,hyper=warn,hyper_util=warn,rustls=warn")
}

/// Initialize logging with the given configuration
///
/// # Example
///
/// ```ignore
/// use nodetrust_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::default())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive_known_levels() {
        assert_eq!(level_directive("trace"), "trace");
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("info"), "info");
        assert_eq!(level_directive("warn"), "warn");
        assert_eq!(level_directive("error"), "error");
    }

    #[test]
    fn test_fatal_maps_to_error() {
        assert_eq!(level_directive("fatal"), "error");
        assert_eq!(level_directive("FATAL"), "error");
    }

    #[test]
    fn test_unknown_level_defaults_to_info() {
        assert_eq!(level_directive("verbose"), "info");
        assert_eq!(level_directive(""), "info");
    }

    #[test]
    fn test_default_filter_parses() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("debug,"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.format, LogFormat::Text);
    }
}
