//! Events that end the serving phase.
//!
//! A termination signal is the normal way out. Listener supervisors and the
//! request pipeline can also escalate fatal conditions here, which sends the
//! process down the same shutdown path with a failing outcome.

use std::any::Any;

use tokio::sync::mpsc;

use crate::lifecycle::signals::Signal;

/// Why the lifecycle left the serving state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// An OS termination signal.
    Signal(Signal),
    /// A listener stopped serving on its own.
    ListenerFailed { listener: String, error: String },
    /// A request handler panicked.
    Panic(String),
}

impl Trigger {
    /// Only a signal is an orderly way to stop.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Trigger::Signal(_))
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Signal(signal) => write!(f, "signal {}", signal),
            Trigger::ListenerFailed { listener, error } => {
                write!(f, "listener {} failed: {}", listener, error)
            }
            Trigger::Panic(message) => write!(f, "panic: {}", message),
        }
    }
}

/// Sending half used by supervisors and the panic layer.
#[derive(Debug, Clone)]
pub struct Escalations {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl Escalations {
    pub fn channel() -> (Self, EscalationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx: tx.clone() },
            EscalationReceiver { _tx: tx, rx },
        )
    }

    pub fn report(&self, trigger: Trigger) {
        if self.tx.send(trigger).is_err() {
            tracing::debug!("Escalation dropped, lifecycle already finished");
        }
    }
}

/// Receiving half, owned by the lifecycle.
#[derive(Debug)]
pub struct EscalationReceiver {
    _tx: mpsc::UnboundedSender<Trigger>,
    rx: mpsc::UnboundedReceiver<Trigger>,
}

impl EscalationReceiver {
    /// Wait for the next escalation. Never observes a closed channel.
    pub async fn recv(&mut self) -> Trigger {
        match self.rx.recv().await {
            Some(trigger) => trigger,
            None => std::future::pending().await,
        }
    }

    /// An escalation that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<Trigger> {
        self.rx.try_recv().ok()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
