//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGINT and SIGTERM handlers before any listener starts
//! - Deliver signals on a buffered channel with room for exactly one
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A signal arriving while one is already pending is dropped
//! - Tests drive the same channel through a [`SignalSender`]

use tokio::sync::mpsc;

/// Termination signals the lifecycle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Capacity-1 channel of termination signals.
#[derive(Debug)]
pub struct SignalChannel {
    tx: mpsc::Sender<Signal>,
    rx: mpsc::Receiver<Signal>,
}

impl SignalChannel {
    /// A channel with no OS handlers attached.
    pub fn manual() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }

    /// A channel fed by the process's SIGINT and SIGTERM handlers.
    ///
    /// Must be called from within a Tokio runtime.
    #[cfg(unix)]
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let channel = Self::manual();
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let sender = channel.sender();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = terminate.recv() => Signal::Terminate,
                    else => break,
                };
                tracing::debug!(signal = %received, "Signal delivered");
                if !sender.send(received) {
                    tracing::debug!(signal = %received, "Signal dropped, one is already pending");
                }
            }
        });

        tracing::debug!("Signal handlers registered");
        Ok(channel)
    }

    #[cfg(not(unix))]
    pub fn register() -> std::io::Result<Self> {
        let channel = Self::manual();
        let sender = channel.sender();

        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                sender.send(Signal::Interrupt);
            }
        });

        Ok(channel)
    }

    pub fn sender(&self) -> SignalSender {
        SignalSender {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next signal.
    ///
    /// The channel keeps its own sender, so this never observes a closed
    /// channel.
    pub async fn recv(&mut self) -> Signal {
        match self.rx.recv().await {
            Some(signal) => signal,
            None => std::future::pending().await,
        }
    }

    /// Take a pending signal without waiting.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }
}

/// Handle for delivering signals into a [`SignalChannel`].
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    /// Deliver a signal. Returns `false` if one is already pending.
    pub fn send(&self, signal: Signal) -> bool {
        self.tx.try_send(signal).is_ok()
    }
}
