//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerConfig (enabled)
//!     → listener.rs (resolve into ListenerSpec, bind socket)
//!     → tls.rs (rustls config for server or mutual mode)
//!     → supervisor.rs (spawn serve task, watch for exit)
//!     → RunningListener (graceful shutdown within a deadline)
//!
//! Listener States:
//!     Bound → Serving → Stopping → Stopped
//! ```
//!
//! # Design Decisions
//! - All sockets are bound before any listener serves
//! - TLS material is loaded once and shared by every TLS listener
//! - An unrequested serve exit is escalated, never ignored

pub mod listener;
pub mod supervisor;
pub mod tls;

pub use listener::{resolve_listeners, ListenerError, ListenerSpec, RunningListener};
pub use supervisor::ListenerSupervisor;
pub use tls::{TlsError, TlsMaterial};
