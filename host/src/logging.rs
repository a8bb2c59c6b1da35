//! Structured logging initialization.
//!
//! Configures the tracing subscriber. The RUST_LOG environment variable
//! takes precedence over the configured level, so operators can turn up
//! verbosity without touching host code, the way the original embedding
//! adjusted its log level at runtime.

use crate::config::{LogFormat, LoggingConfig};

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem. Safe to call more than once; later
/// calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(&config.level)
    };

    let result = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(true).with_target(config.target))
            .try_init(),
        (LogFormat::Pretty, false) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .without_time(),
            )
            .try_init(),
        (LogFormat::Json, true) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(config.target))
            .try_init(),
        (LogFormat::Json, false) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(config.target).without_time())
            .try_init(),
    };
    // A second init (tests, embedded re-entry) keeps the first subscriber.
    let _ = result;
}
