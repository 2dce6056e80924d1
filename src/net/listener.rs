//! Listener specs and running listeners.
//!
//! # Responsibilities
//! - Resolve enabled listener configs into bindable specs
//! - Bind TCP sockets synchronously so failures surface before serving
//! - Expose a bounded-time graceful shutdown for each running listener
//!
//! # Design Decisions
//! - Sockets are bound with the standard library and handed to
//!   `axum_server`; the kernel queues connections between bind and serve
//! - A listener stays `stopping` once shutdown begins, which lets the serve
//!   task tell a requested stop from an unexpected one

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ListenerConfig, ServeConfig, TlsMode};
use crate::lifecycle::shutdown::{Expiry, GracefulShutdown, ShutdownContext, ShutdownError};
use crate::net::tls::{TlsError, TlsMaterial};

/// Errors raised while resolving, binding or serving a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot resolve {address} for listener {listener}: {source}")]
    Resolve {
        listener: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind listener {listener} on {address}: {source}")]
    Bind {
        listener: String,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed for listener {listener}: {source}")]
    Tls {
        listener: String,
        #[source]
        source: TlsError,
    },

    #[error("listener {listener} stopped serving: {source}")]
    Serve {
        listener: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener {0} stopped serving without a shutdown request")]
    UnexpectedExit(String),
}

/// A listener ready to bind: address plus optional TLS config.
#[derive(Clone)]
pub struct ListenerSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    pub tls: Option<RustlsConfig>,
}

impl std::fmt::Debug for ListenerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSpec")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls_mode", &self.tls_mode)
            .finish()
    }
}

impl ListenerSpec {
    /// A plaintext listener.
    pub fn plain(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tls_mode: TlsMode::None,
            tls: None,
        }
    }

    /// A TLS listener in server-only or mutual mode.
    pub fn tls(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        tls_mode: TlsMode,
        config: RustlsConfig,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tls_mode,
            tls: Some(config),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the host and bind a non-blocking socket.
    pub fn bind(&self) -> Result<TcpListener, ListenerError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
                })
            })
            .map_err(|source| ListenerError::Resolve {
                listener: self.name.clone(),
                address: self.address(),
                source,
            })?;

        let bind_error = |source| ListenerError::Bind {
            listener: self.name.clone(),
            address: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        Ok(listener)
    }
}

/// Turn the enabled listener configs accepted by `include` into specs.
///
/// TLS listeners get a rustls config built from `material`; a TLS listener
/// without material is an error.
pub fn resolve_listeners<F>(
    config: &ServeConfig,
    material: Option<&TlsMaterial>,
    include: F,
) -> Result<Vec<ListenerSpec>, ListenerError>
where
    F: Fn(&ListenerConfig) -> bool,
{
    config
        .enabled_listeners()
        .filter(|listener| include(listener))
        .map(|listener| {
            let host = config.host_for(listener);
            if !listener.tls_mode.requires_tls() {
                return Ok(ListenerSpec::plain(&listener.name, host, listener.port));
            }

            let tls_error = |source| ListenerError::Tls {
                listener: listener.name.clone(),
                source,
            };
            let material = material.ok_or_else(|| tls_error(TlsError::MissingMaterial))?;
            let tls = material.server_config(listener.tls_mode).map_err(tls_error)?;
            Ok(ListenerSpec::tls(
                &listener.name,
                host,
                listener.port,
                listener.tls_mode,
                tls,
            ))
        })
        .collect()
}

/// A bound listener with its serve task running.
#[derive(Debug)]
pub struct RunningListener {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    started_at: Instant,
    handle: Handle,
    stopping: AtomicBool,
    stopped: watch::Receiver<bool>,
}

impl RunningListener {
    pub(crate) fn new(
        spec: ListenerSpec,
        local_addr: SocketAddr,
        handle: Handle,
        stopped: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            local_addr,
            started_at: Instant::now(),
            handle,
            stopping: AtomicBool::new(false),
            stopped,
        }
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Connections currently open on this listener.
    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Whether the serve task has finished.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Wait for the serve task to finish; `false` if it went away without
    /// reporting.
    pub async fn wait_stopped(&self) -> bool {
        wait_stopped(self.stopped.clone()).await
    }

    /// Close the socket and every open connection right away.
    pub fn abort(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.handle.shutdown();
        tracing::warn!(listener = %self.spec.name, address = %self.local_addr, "Listener aborted");
    }
}

impl GracefulShutdown for RunningListener {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn tls_mode(&self) -> TlsMode {
        self.spec.tls_mode
    }

    async fn shutdown(&self, ctx: ShutdownContext) -> Result<(), ShutdownError> {
        self.stopping.store(true, Ordering::SeqCst);
        self.handle.graceful_shutdown(None);

        tracing::debug!(
            listener = %self.spec.name,
            connections = self.handle.connection_count(),
            remaining_ms = ctx.remaining().as_millis() as u64,
            "Draining listener"
        );

        tokio::select! {
            drained = wait_stopped(self.stopped.clone()) => {
                if drained {
                    Ok(())
                } else {
                    Err(ShutdownError::Aborted(self.spec.name.clone()))
                }
            }
            expiry = ctx.expired() => {
                let connections = self.handle.connection_count();
                self.handle.shutdown();
                match expiry {
                    Expiry::Deadline => Err(ShutdownError::DeadlineExceeded { connections }),
                    Expiry::Forced => Err(ShutdownError::Forced { connections }),
                }
            }
        }
    }
}

/// `false` if the serve task went away without reporting.
async fn wait_stopped(mut stopped: watch::Receiver<bool>) -> bool {
    stopped.wait_for(|done| *done).await.is_ok()
}
