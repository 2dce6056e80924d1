//! Process lifecycle: serve until triggered, shut down, tear down.
//!
//! # Responsibilities
//! - Start every listener, or fail before serving
//! - Wait for the first trigger: a signal, a failed listener, or a panic
//! - Run the coordinated shutdown, then release shared resources once
//! - Decide the exit status
//!
//! # States
//! ```text
//! Initializing → Serving → ShuttingDown → Closed(Success | Failure)
//! Initializing → Closed(Failure)            (a listener failed to bind)
//! ```
//!
//! # Design Decisions
//! - The serve and shutdown body runs under `catch_unwind`; a panic there
//!   aborts every listener it started, still reaches teardown and always
//!   yields `Failure`
//! - A second signal while draining forces the remaining listeners closed;
//!   a signal already queued behind a failure trigger is not a second one
//! - Exit status is 0 only for a signal-triggered run where every listener
//!   drained and every resource closed

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::build_info::BuildInfo;
use crate::http::escalate_panics;
use crate::lifecycle::resources::{SharedResources, TeardownReport};
use crate::lifecycle::shutdown::{GracefulShutdown, ShutdownCoordinator, ShutdownReport};
use crate::lifecycle::signals::{Signal, SignalChannel};
use crate::lifecycle::trigger::{panic_message, EscalationReceiver, Escalations, Trigger};
use crate::net::listener::{ListenerError, ListenerSpec, RunningListener};
use crate::net::supervisor::ListenerSupervisor;

/// Final result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Serving,
    ShuttingDown,
    Closed(Outcome),
}

/// Observable state, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: LifecycleState,
    /// Name and bound address of every running listener.
    pub listeners: Vec<(String, SocketAddr)>,
}

impl Status {
    pub fn address_of(&self, listener: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(name, _)| name == listener)
            .map(|(_, addr)| *addr)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct Completion {
    pub outcome: Outcome,
    /// What ended serving; `None` if serving never started or the body panicked.
    pub trigger: Option<Trigger>,
    /// Failures escalated after the trigger, while draining.
    pub late_failures: Vec<Trigger>,
    pub startup_error: Option<String>,
    pub panic: Option<String>,
    pub shutdown: Option<ShutdownReport>,
    pub teardown: TeardownReport,
}

impl Completion {
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }
}

/// How the serve and shutdown body ended.
enum Served {
    StartFailed(ListenerError),
    Finished {
        trigger: Trigger,
        late_failures: Vec<Trigger>,
        report: ShutdownReport,
    },
}

/// Failure points tests can switch on.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    #[cfg(test)]
    panic_while_serving: bool,
}

impl Faults {
    fn while_serving(&self) {
        #[cfg(test)]
        if self.panic_while_serving {
            panic!("lifecycle body exploded");
        }
    }
}

/// Composition root for one process run.
#[derive(Debug)]
pub struct Lifecycle {
    listeners: Vec<ListenerSpec>,
    handler: Router,
    resources: SharedResources,
    shutdown_timeout: Duration,
    build: BuildInfo,
    status: watch::Sender<Status>,
    faults: Faults,
}

impl Lifecycle {
    pub fn new(
        listeners: Vec<ListenerSpec>,
        handler: Router,
        resources: SharedResources,
        shutdown_timeout: Duration,
        build: BuildInfo,
    ) -> Self {
        let (status, _) = watch::channel(Status {
            state: LifecycleState::Initializing,
            listeners: Vec::new(),
        });
        Self {
            listeners,
            handler,
            resources,
            shutdown_timeout,
            build,
            status,
            faults: Faults::default(),
        }
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Register SIGINT and SIGTERM, then run to completion.
    pub async fn run(self) -> std::io::Result<Completion> {
        let signals = SignalChannel::register()?;
        Ok(self.run_with_signals(signals).await)
    }

    /// Run to completion, taking termination signals from `signals`.
    pub async fn run_with_signals(self, signals: SignalChannel) -> Completion {
        let span = tracing::info_span!(
            "lifecycle",
            version = %self.build.version,
            git_branch = %self.build.git_branch,
            git_commit = %self.build.git_commit,
        );
        self.drive(signals).instrument(span).await
    }

    async fn drive(self, mut signals: SignalChannel) -> Completion {
        let Lifecycle {
            listeners,
            handler,
            resources,
            shutdown_timeout,
            build: _,
            status,
            faults,
        } = self;

        tracing::info!(
            listeners = listeners.len(),
            timeout_ms = shutdown_timeout.as_millis() as u64,
            "Starting server lifecycle"
        );

        let mut started = Vec::new();
        let body = serve_and_shutdown(
            listeners,
            handler,
            &mut signals,
            &status,
            shutdown_timeout,
            &mut started,
            faults,
        );
        let served = AssertUnwindSafe(body).catch_unwind().await;

        let mut completion = match served {
            Ok(Served::StartFailed(error)) => {
                tracing::error!(error = %error, "Listener failed to start");
                Completion::empty(Some(error.to_string()), None)
            }
            Ok(Served::Finished {
                trigger,
                late_failures,
                report,
            }) => Completion {
                trigger: Some(trigger),
                late_failures,
                shutdown: Some(report),
                ..Completion::empty(None, None)
            },
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(
                    panic = %message,
                    listeners = started.len(),
                    "Lifecycle panicked, aborting listeners"
                );
                abort_all(&started, shutdown_timeout).await;
                Completion::empty(None, Some(message))
            }
        };

        completion.teardown = resources.teardown(completion.panic.as_deref());
        completion.outcome = decide(&completion);

        transition(&status, LifecycleState::Closed(completion.outcome), None);
        tracing::info!(
            outcome = ?completion.outcome,
            exit_code = completion.exit_code(),
            "Server lifecycle finished"
        );
        completion
    }
}

impl Completion {
    fn empty(startup_error: Option<String>, panic: Option<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            trigger: None,
            late_failures: Vec::new(),
            startup_error,
            panic,
            shutdown: None,
            teardown: TeardownReport::default(),
        }
    }
}

fn decide(completion: &Completion) -> Outcome {
    let orderly = matches!(&completion.trigger, Some(trigger) if !trigger.is_failure());
    let drained = completion
        .shutdown
        .as_ref()
        .is_some_and(|report| !report.any_failed());

    if orderly
        && drained
        && completion.late_failures.is_empty()
        && completion.panic.is_none()
        && !completion.teardown.any_failed()
    {
        Outcome::Success
    } else {
        Outcome::Failure
    }
}

/// Serve until triggered, then drain. Started listeners are recorded in
/// `started`, which outlives this future if it panics.
async fn serve_and_shutdown(
    specs: Vec<ListenerSpec>,
    handler: Router,
    signals: &mut SignalChannel,
    status: &watch::Sender<Status>,
    timeout: Duration,
    started: &mut Vec<Arc<RunningListener>>,
    faults: Faults,
) -> Served {
    let (escalations, mut escalated) = Escalations::channel();
    let supervisor = ListenerSupervisor::new(escalate_panics(handler, escalations.clone()), escalations);

    match supervisor.start_all(specs) {
        Ok(running) => *started = running,
        Err(error) => return Served::StartFailed(error),
    }
    let running: &[Arc<RunningListener>] = started;

    let bound = running
        .iter()
        .map(|listener| (listener.name().to_string(), listener.local_addr()))
        .collect();
    transition(status, LifecycleState::Serving, Some(bound));
    faults.while_serving();

    let trigger = tokio::select! {
        signal = signals.recv() => Trigger::Signal(signal),
        trigger = escalated.recv() => trigger,
    };
    if trigger.is_failure() {
        tracing::error!(trigger = %trigger, "Shutting down after failure");
    } else {
        tracing::info!(trigger = %trigger, "Received signal, shutting down");
    }

    absorb_pending(&trigger, signals);

    transition(status, LifecycleState::ShuttingDown, None);
    let report = drain(running, signals, timeout).await;
    let late_failures = collect_late(&mut escalated);

    Served::Finished {
        trigger,
        late_failures,
        report,
    }
}

/// Run the coordinator; a further signal forces the close.
async fn drain(
    running: &[Arc<RunningListener>],
    signals: &mut SignalChannel,
    timeout: Duration,
) -> ShutdownReport {
    let force = CancellationToken::new();
    let coordinator = ShutdownCoordinator::new(timeout);
    let shutdown = coordinator.shutdown_all(running, force.clone());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            report = &mut shutdown => return report,
            signal = signals.recv(), if !force.is_cancelled() => {
                tracing::warn!(signal = %signal, "Second signal received, forcing shutdown");
                force.cancel();
            }
        }
    }
}

/// A signal queued before a failure trigger won belongs to this shutdown,
/// not to a later one.
fn absorb_pending(trigger: &Trigger, signals: &mut SignalChannel) -> Option<Signal> {
    if !trigger.is_failure() {
        return None;
    }
    let pending = signals.try_recv()?;
    tracing::info!(signal = %pending, trigger = %trigger, "Signal arrived with failure, draining once");
    Some(pending)
}

/// Stop listeners left running by a panicked body and wait for their serve
/// tasks, so no socket outlives the run.
async fn abort_all(running: &[Arc<RunningListener>], timeout: Duration) {
    for listener in running.iter().filter(|listener| !listener.is_stopped()) {
        listener.abort();
    }

    let stopped = join_all(running.iter().map(|listener| listener.wait_stopped()));
    if tokio::time::timeout(timeout, stopped).await.is_err() {
        tracing::warn!(
            timeout_ms = timeout.as_millis() as u64,
            "Aborted listeners did not stop in time"
        );
    }
}

fn collect_late(escalated: &mut EscalationReceiver) -> Vec<Trigger> {
    let mut late = Vec::new();
    while let Some(trigger) = escalated.try_recv() {
        tracing::error!(trigger = %trigger, "Failure escalated during shutdown");
        late.push(trigger);
    }
    late
}

fn transition(
    status: &watch::Sender<Status>,
    next: LifecycleState,
    listeners: Option<Vec<(String, SocketAddr)>>,
) {
    status.send_modify(|current| {
        tracing::info!(from = ?current.state, to = ?next, "Lifecycle state changed");
        current.state = next;
        if let Some(listeners) = listeners {
            current.listeners = listeners;
        }
    });
}
