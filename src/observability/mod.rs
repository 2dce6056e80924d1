//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters and histograms, Prometheus exporter)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (text or JSON) for machine parsing
//! - Build info travels as span fields, not global state
//! - Metrics are cheap no-ops when the exporter is disabled

pub mod logging;
pub mod metrics;

pub use metrics::Telemetry;
