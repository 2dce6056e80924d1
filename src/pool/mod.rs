//! Connection pools for backing services.
//!
//! The database and cache collaborators are plain TCP services; each gets a
//! bounded pool that is connected at startup, checked by the readiness
//! probe, and closed exactly once during teardown.

pub mod tcp;

pub use tcp::{PoolError, PoolStatus, PooledConnection, TcpPool};
