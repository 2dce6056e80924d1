//! Listener supervision.
//!
//! # Responsibilities
//! - Bind each listener and spawn its serve task
//! - Notice when a serve task ends, whether asked to or not
//! - Escalate an unrequested exit so the process shuts down
//!
//! # Design Decisions
//! - A serve task always reports completion on its `stopped` channel; a
//!   channel that closes without a report means the task was torn down
//! - Starting a set is all-or-nothing: on a bind failure the listeners
//!   already running are aborted

use std::sync::Arc;

use axum::Router;
use axum_server::Handle;
use tokio::sync::watch;

use crate::lifecycle::trigger::{Escalations, Trigger};
use crate::net::listener::{ListenerError, ListenerSpec, RunningListener};
use crate::observability::metrics;

/// Starts listeners and watches their serve tasks.
#[derive(Debug, Clone)]
pub struct ListenerSupervisor {
    handler: Router,
    escalations: Escalations,
}

impl ListenerSupervisor {
    pub fn new(handler: Router, escalations: Escalations) -> Self {
        Self {
            handler,
            escalations,
        }
    }

    /// Bind one listener and start serving on it.
    pub fn start(&self, spec: ListenerSpec) -> Result<Arc<RunningListener>, ListenerError> {
        let socket = spec.bind()?;
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            listener: spec.name.clone(),
            address: spec.address(),
            source,
        })?;

        let handle = Handle::new();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let tls = spec.tls.clone();
        let listener = Arc::new(RunningListener::new(spec, local_addr, handle.clone(), stopped_rx));

        let service = self.handler.clone().into_make_service();
        let escalations = self.escalations.clone();
        let watched = Arc::clone(&listener);

        tokio::spawn(async move {
            let served = match tls {
                Some(config) => {
                    axum_server::tls_rustls::from_tcp_rustls(socket, config)
                        .handle(handle)
                        .serve(service)
                        .await
                }
                None => axum_server::from_tcp(socket).handle(handle).serve(service).await,
            };

            let name = watched.spec().name.clone();
            let failure = match served {
                Ok(()) if watched.is_stopping() => None,
                Ok(()) => Some(ListenerError::UnexpectedExit(name.clone())),
                Err(source) => Some(ListenerError::Serve {
                    listener: name.clone(),
                    source,
                }),
            };

            match failure {
                None => tracing::debug!(listener = %name, "Serve loop finished"),
                Some(error) => {
                    tracing::error!(listener = %name, error = %error, "Listener failed");
                    escalations.report(Trigger::ListenerFailed {
                        listener: name,
                        error: error.to_string(),
                    });
                }
            }

            let _ = stopped_tx.send(true);
        });

        let spec = listener.spec();
        metrics::record_listener_started(&spec.name, spec.tls_mode);
        tracing::info!(
            listener = %spec.name,
            address = %local_addr,
            tls_mode = %spec.tls_mode,
            "Starting listener"
        );

        Ok(listener)
    }

    /// Start every listener, or none of them.
    pub fn start_all(
        &self,
        specs: Vec<ListenerSpec>,
    ) -> Result<Vec<Arc<RunningListener>>, ListenerError> {
        let mut running: Vec<Arc<RunningListener>> = Vec::with_capacity(specs.len());

        for spec in specs {
            match self.start(spec) {
                Ok(listener) => running.push(listener),
                Err(e) => {
                    for listener in &running {
                        listener.abort();
                    }
                    return Err(e);
                }
            }
        }

        Ok(running)
    }
}
