//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Install the Prometheus exporter when enabled
//! - Record listener and teardown metrics
//! - Stop the exporter during teardown
//!
//! # Metrics
//! - `listener_starts_total` (counter): listeners bound, by name and TLS mode
//! - `listener_shutdowns_total` (counter): shutdown outcomes, by name
//! - `listener_shutdown_duration_seconds` (histogram): per-listener drain time
//! - `resource_closes_total` (counter): resource close outcomes
//! - `http_requests_total` (counter): requests by method and status
//! - `http_request_duration_seconds` (histogram): request latency

use std::net::SocketAddr;
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ObservabilityConfig, TlsMode};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid metrics address {0}")]
    InvalidAddress(String),

    #[error("failed to build Prometheus exporter: {0}")]
    Build(String),

    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Handle on the telemetry exporter.
#[derive(Debug)]
pub struct Telemetry {
    exporter: Mutex<Option<JoinHandle<()>>>,
    stopped: Once,
}

impl Telemetry {
    /// No exporter; metric calls are no-ops.
    pub fn disabled() -> Self {
        Self {
            exporter: Mutex::new(None),
            stopped: Once::new(),
        }
    }

    /// Install the global recorder and spawn the exporter.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install(config: &ObservabilityConfig) -> Result<Self, TelemetryError> {
        if !config.metrics_enabled {
            tracing::info!("Metrics exporter disabled");
            return Ok(Self::disabled());
        }

        let addr: SocketAddr = config
            .metrics_address
            .parse()
            .map_err(|_| TelemetryError::InvalidAddress(config.metrics_address.clone()))?;

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(addr)
            .build()
            .map_err(|e| TelemetryError::Build(e.to_string()))?;
        ::metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::AlreadyInstalled)?;

        let task = tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "Metrics exporter stopped");
            }
        });

        tracing::info!(address = %addr, "Metrics exporter listening");

        Ok(Self {
            exporter: Mutex::new(Some(task)),
            stopped: Once::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        match self.exporter.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Stop the exporter. Only the first call has an effect.
    pub fn shutdown(&self) {
        self.stopped.call_once(|| {
            let task = match self.exporter.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(task) = task {
                task.abort();
                tracing::info!("Telemetry exporter stopped");
            }
        });
    }
}

pub fn record_listener_started(listener: &str, tls_mode: TlsMode) {
    ::metrics::counter!(
        "listener_starts_total",
        "listener" => listener.to_string(),
        "tls_mode" => tls_mode.as_str()
    )
    .increment(1);
}

pub fn record_listener_shutdown(listener: &str, ok: bool, elapsed: Duration) {
    let outcome = if ok { "ok" } else { "error" };
    ::metrics::counter!(
        "listener_shutdowns_total",
        "listener" => listener.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    ::metrics::histogram!(
        "listener_shutdown_duration_seconds",
        "listener" => listener.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_resource_close(resource: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    ::metrics::counter!("resource_closes_total", "resource" => resource, "outcome" => outcome)
        .increment(1);
}

pub fn record_request(method: &str, status: u16, started: Instant) {
    ::metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    ::metrics::histogram!("http_request_duration_seconds", "method" => method.to_string())
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_telemetry_shuts_down_quietly() {
        let telemetry = Telemetry::disabled();
        assert!(!telemetry.is_running());
        telemetry.shutdown();
        telemetry.shutdown();
    }

    #[tokio::test]
    async fn install_respects_disabled_flag() {
        let telemetry = Telemetry::install(&ObservabilityConfig::default()).unwrap();
        assert!(!telemetry.is_running());
    }

    #[tokio::test]
    async fn rejects_bad_address() {
        let config = ObservabilityConfig {
            metrics_enabled: true,
            metrics_address: "not an address".to_string(),
            ..ObservabilityConfig::default()
        };
        assert!(matches!(
            Telemetry::install(&config),
            Err(TelemetryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_listener_started("no-tls", TlsMode::None);
        record_listener_shutdown("no-tls", true, Duration::from_millis(3));
        record_resource_close("database", false);
        record_request("GET", 200, Instant::now());
    }
}
