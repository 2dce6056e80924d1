//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Pick text or JSON output from configuration
//! - Flush buffered output during teardown
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level
//! - Output is written synchronously to stdout, so flushing the standard
//!   streams is all teardown has to do

use std::io::Write;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// The global subscriber could not be installed.
#[derive(Debug, thiserror::Error)]
#[error("failed to initialize logging: {0}")]
pub struct LoggingError(String);

/// Install the global tracing subscriber.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.log_format.as_str() {
        "json" => registry.with(fmt::layer().json()).try_init(),
        _ => registry.with(fmt::layer()).try_init(),
    };
    result.map_err(|e| LoggingError(e.to_string()))?;

    tracing::debug!(
        level = %config.log_level,
        format = %config.log_format,
        "Logging initialized"
    );
    Ok(())
}

/// Flush anything still buffered in the standard streams.
pub fn flush() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}
