//! Multi-listener server lifecycle manager.
//!
//! Starts several independent listeners (plain, TLS, mutual TLS and a
//! localhost-only health listener) that share one request pipeline, waits
//! for a termination signal, shuts every listener down concurrently within
//! one deadline, and releases shared resources exactly once.

pub mod build_info;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;

pub use build_info::BuildInfo;
pub use config::ServeConfig;
pub use lifecycle::{Completion, Lifecycle, Outcome, Profile};
