//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (any listener)
//!     → server.rs (request ID, tracing, timeout, metrics)
//!     → /health, /health/ready, or JSON 404
//!     → panic layer (500 + escalation to the lifecycle)
//!     → Send to client
//! ```

pub mod server;

pub use server::{build_handler, escalate_panics, AppState};
