//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Install telemetry → Connect pools → Load TLS → Resolve listeners
//!
//! Run (process.rs):
//!     Bind all listeners → Serve → wait for Trigger (trigger.rs)
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     second signal   → Force remaining listeners closed
//!
//! Shutdown (shutdown.rs):
//!     Fan out to every listener → Collect one result each → Report
//!
//! Teardown (resources.rs):
//!     Database → Cache → Telemetry → Flush logs (exactly once)
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then resources, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline shared by every listener

pub mod process;
pub mod resources;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod trigger;

pub use process::{Completion, Lifecycle, LifecycleState, Outcome, Status};
pub use resources::{CloseError, Closeable, ResourceCloser, SharedResources, TeardownReport};
pub use shutdown::{ShutdownCoordinator, ShutdownError, ShutdownReport, ShutdownResult};
pub use signals::{Signal, SignalChannel, SignalSender};
pub use startup::{prepare, Profile, StartupError};
pub use trigger::Trigger;
