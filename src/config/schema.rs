//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound for the graceful shutdown window, in seconds.
pub const MIN_GRACEFUL_SHUTDOWN_SECS: u64 = 5;

/// Root configuration for the server process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Process-wide server settings.
    pub server: ServerConfig,

    /// Listener definitions, one per network endpoint.
    pub listeners: Vec<ListenerConfig>,

    /// TLS material shared by all TLS and mutual-TLS listeners.
    pub tls: Option<TlsConfig>,

    /// Database connection pool.
    pub database: Option<PoolConfig>,

    /// Cache connection pool.
    pub cache: Option<PoolConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            listeners: default_listeners(),
            tls: None,
            database: None,
            cache: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServeConfig {
    /// Listeners that are switched on.
    pub fn enabled_listeners(&self) -> impl Iterator<Item = &ListenerConfig> {
        self.listeners.iter().filter(|l| l.enabled)
    }

    /// Host a listener binds to, falling back to the server interface.
    pub fn host_for<'a>(&'a self, listener: &'a ListenerConfig) -> &'a str {
        listener.host.as_deref().unwrap_or(&self.server.interface)
    }
}

/// Process-wide server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the public listeners bind to.
    pub interface: String,

    /// Time allowed for listeners to drain after a termination signal.
    pub graceful_shutdown_timeout_secs: u64,

    /// Per-request timeout applied by the shared handler.
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            graceful_shutdown_timeout_secs: 25,
            request_timeout_secs: 30,
        }
    }
}

/// How a listener secures its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    None,
    /// TLS with a server certificate, no client authentication.
    Server,
    /// TLS that requires and verifies a client certificate.
    Mutual,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::None => "none",
            TlsMode::Server => "server",
            TlsMode::Mutual => "mutual",
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, TlsMode::None)
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listener identifier for logging and shutdown reporting.
    pub name: String,

    /// Whether this listener is started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Bind host. Defaults to `server.interface`.
    #[serde(default)]
    pub host: Option<String>,

    /// Bind port (0 picks an ephemeral port).
    pub port: u16,

    /// Transport security for this listener.
    #[serde(default)]
    pub tls_mode: TlsMode,
}

fn default_enabled() -> bool {
    true
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, port: u16, tls_mode: TlsMode) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            host: None,
            port,
            tls_mode,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// The listener set a fresh install starts with. Only the plain listener is
/// enabled since the TLS listeners need certificate material.
fn default_listeners() -> Vec<ListenerConfig> {
    vec![
        ListenerConfig::new("health", 8090, TlsMode::None).with_host("127.0.0.1"),
        ListenerConfig::new("no-tls", 8080, TlsMode::None),
        ListenerConfig {
            enabled: false,
            ..ListenerConfig::new("tls", 8443, TlsMode::Server)
        },
        ListenerConfig {
            enabled: false,
            ..ListenerConfig::new("mutual-tls", 9443, TlsMode::Mutual)
        },
    ]
}

/// TLS certificate material (PEM files).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to the certificate chain.
    pub cert_path: String,

    /// Path to the private key.
    pub key_path: String,

    /// CA bundle used to verify client certificates on mutual-TLS listeners.
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

/// Connection pool settings for a database or cache endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Endpoint address (e.g., "127.0.0.1:5432").
    pub address: String,

    /// Maximum connections held by the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Timeout for establishing a single connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    5
}

impl PoolConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: "text" or "json".
    pub log_format: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
