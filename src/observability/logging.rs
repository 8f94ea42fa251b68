//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. The library itself only emits
//! events; binaries decide where they go.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single
//! deployment can raise verbosity for one module without a config change:
//! `RUST_LOG=idempotency_gateway::idempotency=debug`.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::error::{IdempotencyError, IdempotencyResult};
use crate::observability::config::{LogConfig, LogFormat};

/// Parse a level name, rejecting anything `tracing` does not know
pub fn parse_level(level: &str) -> IdempotencyResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(IdempotencyError::config(format!("Unknown log level: {}", other))),
    }
}

/// Build the filter: `RUST_LOG` if present, otherwise the configured level
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Initialize the tracing subscriber.
///
/// Calling this more than once is harmless; later calls keep the subscriber
/// that is already installed.
pub fn init_logging(config: &LogConfig) -> IdempotencyResult<()> {
    let level = parse_level(&config.level)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter(level))
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter(level))
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %level, "Structured logging initialized");
    Ok(())
}
