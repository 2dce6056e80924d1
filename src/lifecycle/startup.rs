//! Startup orchestration.
//!
//! # Responsibilities
//! - Install telemetry and connect the backing pools
//! - Load TLS material when an included listener needs it
//! - Resolve listener specs and build the shared handler
//! - Hand everything to a [`Lifecycle`] ready to run
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Resources acquired before a failure are released by the drop of
//!   [`SharedResources`]
//! - Listeners bind last, inside the lifecycle (traffic only when ready)

use thiserror::Error;

use crate::build_info::BuildInfo;
use crate::config::{ListenerConfig, ServeConfig};
use crate::http::{build_handler, AppState};
use crate::lifecycle::process::Lifecycle;
use crate::lifecycle::resources::SharedResources;
use crate::net::listener::{resolve_listeners, ListenerError};
use crate::net::tls::{TlsError, TlsMaterial};
use crate::observability::metrics::TelemetryError;
use crate::observability::Telemetry;
use crate::pool::{PoolError, TcpPool};

/// Name of the localhost-only health listener.
pub const HEALTH_LISTENER: &str = "health";

/// Errors that stop the process before it serves.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("telemetry: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("TLS: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("{pool} pool: {source}")]
    Pool {
        pool: &'static str,
        #[source]
        source: PoolError,
    },
}

/// Which entry point is starting; decides the listener and pool set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// The main server: every enabled listener, database and cache.
    Serve,
    /// The orders server: no health listener and no cache.
    Orders,
}

impl Profile {
    pub fn service_name(self) -> &'static str {
        match self {
            Profile::Serve => "listenerd",
            Profile::Orders => "listenerd-orders",
        }
    }

    pub fn includes(self, listener: &ListenerConfig) -> bool {
        match self {
            Profile::Serve => true,
            Profile::Orders => listener.name != HEALTH_LISTENER,
        }
    }

    pub fn uses_cache(self) -> bool {
        matches!(self, Profile::Serve)
    }
}

/// Build a ready-to-run lifecycle from a validated config.
pub async fn prepare(
    config: &ServeConfig,
    profile: Profile,
    build: BuildInfo,
) -> Result<Lifecycle, StartupError> {
    let telemetry = Telemetry::install(&config.observability)?;
    let mut resources = SharedResources::new(telemetry);
    let mut state = AppState::new(profile.service_name(), build.clone());

    if let Some(database) = &config.database {
        let pool = TcpPool::connect("database", database)
            .await
            .map_err(|source| StartupError::Pool {
                pool: "database",
                source,
            })?;
        resources = resources.with_database(pool.clone());
        state.database = Some(pool);
    }

    match &config.cache {
        Some(cache) if profile.uses_cache() => {
            let pool = TcpPool::connect("cache", cache)
                .await
                .map_err(|source| StartupError::Pool {
                    pool: "cache",
                    source,
                })?;
            resources = resources.with_cache(pool.clone());
            state.cache = Some(pool);
        }
        Some(_) => tracing::debug!(service = profile.service_name(), "Cache pool not used"),
        None => {}
    }

    let needs_tls = config
        .enabled_listeners()
        .any(|listener| profile.includes(listener) && listener.tls_mode.requires_tls());
    let material = match &config.tls {
        Some(tls) if needs_tls => Some(TlsMaterial::load(tls)?),
        _ => None,
    };

    let listeners = resolve_listeners(config, material.as_ref(), |listener| {
        profile.includes(listener)
    })?;
    let handler = build_handler(state, config.server.request_timeout());

    tracing::info!(
        service = profile.service_name(),
        listeners = listeners.len(),
        database = config.database.is_some(),
        cache = resources.cache().is_some(),
        "Startup complete"
    );

    Ok(Lifecycle::new(
        listeners,
        handler,
        resources,
        config.server.graceful_shutdown_timeout(),
        build,
    ))
}
