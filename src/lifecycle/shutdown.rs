//! Shutdown coordination across listeners.
//!
//! # Responsibilities
//! - Derive one shared deadline from the configured graceful timeout
//! - Fan out a shutdown call to every running listener concurrently
//! - Collect exactly one result per listener in a concurrency-safe store
//! - Report results in a stable order and decide whether any failed
//!
//! # Design Decisions
//! - The coordinator adds no timeout of its own; each listener honors the
//!   shared deadline
//! - A second signal cancels the `force` token, closing connections that are
//!   still draining
//! - A fan-out task that panics is still reported, as a failure

use std::future::Future;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TlsMode;
use crate::observability::metrics;

/// Why a listener failed to shut down cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("graceful shutdown deadline exceeded with {connections} connections open")]
    DeadlineExceeded { connections: usize },

    #[error("shutdown forced with {connections} connections open")]
    Forced { connections: usize },

    #[error("serve task for {0} ended without reporting")]
    Aborted(String),

    #[error("shutdown task panicked")]
    Panicked,
}

/// What ended a shutdown wait early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Deadline,
    Forced,
}

/// Shared deadline handed to every listener's shutdown call.
#[derive(Debug, Clone)]
pub struct ShutdownContext {
    deadline: Instant,
    timeout: Duration,
    force: CancellationToken,
}

impl ShutdownContext {
    pub fn new(timeout: Duration, force: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            force,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Resolves once the deadline passes or shutdown is forced.
    pub async fn expired(&self) -> Expiry {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => Expiry::Deadline,
            _ = self.force.cancelled() => Expiry::Forced,
        }
    }
}

/// Something that can be stopped within a [`ShutdownContext`].
pub trait GracefulShutdown: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn local_addr(&self) -> SocketAddr;

    fn tls_mode(&self) -> TlsMode;

    /// Stop accepting, drain in-flight work, and return once drained or
    /// once the context expires.
    fn shutdown(
        &self,
        ctx: ShutdownContext,
    ) -> impl Future<Output = Result<(), ShutdownError>> + Send;
}

/// Concurrency-safe keyed store, read back in key order.
///
/// The first value recorded for a key wins; later writes are rejected so a
/// result can never be double-counted.
#[derive(Debug)]
pub struct ResultStore<K, V>
where
    K: Eq + Hash,
{
    inner: Arc<DashMap<K, V>>,
}

impl<K: Eq + Hash, V> Clone for ResultStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, V> Default for ResultStore<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> ResultStore<K, V>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value. Returns `false` if the key already had one.
    pub fn record(&self, key: K, value: V) -> bool {
        match self.inner.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove every entry and return them sorted by key.
    pub fn drain_sorted(&self) -> Vec<(K, V)> {
        let keys: Vec<K> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        let mut entries: Vec<(K, V)> = keys
            .into_iter()
            .filter_map(|key| self.inner.remove(&key))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Outcome of shutting down one listener.
#[derive(Debug, Clone)]
pub struct ShutdownResult {
    pub listener: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tls_mode: TlsMode,
    pub elapsed: Duration,
    pub error: Option<ShutdownError>,
}

impl ShutdownResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of a fan-out, sorted by listener name.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub results: Vec<ShutdownResult>,
    pub elapsed: Duration,
    pub timeout: Duration,
}

impl ShutdownReport {
    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|r| !r.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ShutdownResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn get(&self, listener: &str) -> Option<&ShutdownResult> {
        self.results.iter().find(|r| r.listener == listener)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

type ListenerKey = (String, SocketAddr);

/// Fans out bounded-time shutdown calls and aggregates their results.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shut down every listener concurrently and wait for all of them.
    pub async fn shutdown_all<L: GracefulShutdown>(
        &self,
        listeners: &[Arc<L>],
        force: CancellationToken,
    ) -> ShutdownReport {
        let started = Instant::now();
        let ctx = ShutdownContext::new(self.timeout, force);

        tracing::info!(
            listeners = listeners.len(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Waiting for listeners to shut down"
        );

        let store: ResultStore<ListenerKey, ShutdownResult> = ResultStore::new();
        let mut tasks = JoinSet::new();

        for listener in listeners {
            let listener = Arc::clone(listener);
            let store = store.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let begun = Instant::now();
                let error = listener.shutdown(ctx).await.err();
                let result = result_for(listener.as_ref(), begun.elapsed(), error);
                let key = (listener.name().to_string(), listener.local_addr());
                if !store.record(key, result) {
                    tracing::warn!(listener = %listener.name(), "Duplicate shutdown result ignored");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Shutdown task failed");
            }
        }

        for listener in listeners {
            let key = (listener.name().to_string(), listener.local_addr());
            if !store.contains(&key) {
                let result = result_for(listener.as_ref(), started.elapsed(), Some(ShutdownError::Panicked));
                store.record(key, result);
            }
        }

        let results: Vec<ShutdownResult> = store
            .drain_sorted()
            .into_iter()
            .map(|(_, result)| result)
            .collect();

        let elapsed = started.elapsed();
        for result in &results {
            log_result(result, self.timeout);
            metrics::record_listener_shutdown(&result.listener, result.is_ok(), result.elapsed);
        }

        tracing::info!(
            listeners = results.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "All listeners are shut down"
        );

        ShutdownReport {
            results,
            elapsed,
            timeout: self.timeout,
        }
    }
}

fn result_for<L: GracefulShutdown>(
    listener: &L,
    elapsed: Duration,
    error: Option<ShutdownError>,
) -> ShutdownResult {
    let addr = listener.local_addr();
    ShutdownResult {
        listener: listener.name().to_string(),
        addr: addr.ip(),
        port: addr.port(),
        tls_mode: listener.tls_mode(),
        elapsed,
        error,
    }
}

fn log_result(result: &ShutdownResult, timeout: Duration) {
    match &result.error {
        Some(error) => tracing::error!(
            listener = %result.listener,
            addr = %result.addr,
            port = result.port,
            tls_mode = %result.tls_mode,
            elapsed_ms = result.elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            error = %error,
            "Shutdown error"
        ),
        None => tracing::info!(
            listener = %result.listener,
            addr = %result.addr,
            port = result.port,
            tls_mode = %result.tls_mode,
            elapsed_ms = result.elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Listener shut down"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Drain after the given delay.
        Drain(Duration),
        /// Never drain; wait for the context to expire.
        Hang,
        Fail,
        Panic,
    }

    struct FakeListener {
        name: String,
        addr: SocketAddr,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeListener {
        fn new(name: &str, port: u16, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl GracefulShutdown for FakeListener {
        fn name(&self) -> &str {
            &self.name
        }

        fn local_addr(&self) -> SocketAddr {
            self.addr
        }

        fn tls_mode(&self) -> TlsMode {
            TlsMode::None
        }

        async fn shutdown(&self, ctx: ShutdownContext) -> Result<(), ShutdownError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Drain(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                Behavior::Hang => match ctx.expired().await {
                    Expiry::Deadline => Err(ShutdownError::DeadlineExceeded { connections: 1 }),
                    Expiry::Forced => Err(ShutdownError::Forced { connections: 1 }),
                },
                Behavior::Fail => Err(ShutdownError::DeadlineExceeded { connections: 3 }),
                Behavior::Panic => panic!("listener exploded"),
            }
        }
    }

    #[test]
    fn result_store_first_write_wins() {
        let store: ResultStore<String, u32> = ResultStore::new();
        assert!(store.record("b".into(), 1));
        assert!(store.record("a".into(), 2));
        assert!(!store.record("b".into(), 3));
        assert_eq!(store.len(), 2);

        let drained = store.drain_sorted();
        assert_eq!(drained, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
        assert!(store.is_empty());
    }

    #[test]
    fn result_store_concurrent_writers() {
        let store: ResultStore<usize, usize> = ResultStore::new();
        std::thread::scope(|scope| {
            for t in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..100 {
                        store.record(i, t);
                    }
                });
            }
        });
        let drained = store.drain_sorted();
        assert_eq!(drained.len(), 100);
        assert!(drained.iter().enumerate().all(|(i, (k, _))| i == *k));
    }

    #[tokio::test]
    async fn one_result_per_listener_in_name_order() {
        let listeners = vec![
            FakeListener::new("tls", 8443, Behavior::Drain(Duration::ZERO)),
            FakeListener::new("mutual-tls", 9443, Behavior::Drain(Duration::ZERO)),
            FakeListener::new("no-tls", 8080, Behavior::Drain(Duration::ZERO)),
        ];
        let report = ShutdownCoordinator::new(Duration::from_secs(2))
            .shutdown_all(&listeners, CancellationToken::new())
            .await;

        let names: Vec<_> = report.results.iter().map(|r| r.listener.as_str()).collect();
        assert_eq!(names, vec!["mutual-tls", "no-tls", "tls"]);
        assert!(!report.any_failed());
        for listener in &listeners {
            assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn empty_listener_set() {
        let listeners: Vec<Arc<FakeListener>> = Vec::new();
        let report = ShutdownCoordinator::new(Duration::from_secs(2))
            .shutdown_all(&listeners, CancellationToken::new())
            .await;
        assert!(report.is_empty());
        assert!(!report.any_failed());
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_others() {
        let listeners = vec![
            FakeListener::new("a", 1001, Behavior::Drain(Duration::from_millis(10))),
            FakeListener::new("b", 1002, Behavior::Fail),
            FakeListener::new("c", 1003, Behavior::Drain(Duration::from_millis(10))),
        ];
        let report = ShutdownCoordinator::new(Duration::from_secs(2))
            .shutdown_all(&listeners, CancellationToken::new())
            .await;

        assert_eq!(report.len(), 3);
        assert!(report.any_failed());
        assert!(report.get("a").unwrap().is_ok());
        assert!(report.get("c").unwrap().is_ok());
        assert_eq!(
            report.get("b").unwrap().error,
            Some(ShutdownError::DeadlineExceeded { connections: 3 })
        );
        assert_eq!(report.failed().count(), 1);
    }

    #[tokio::test]
    async fn hanging_listener_is_bounded_by_timeout() {
        let listeners = vec![
            FakeListener::new("stuck", 1001, Behavior::Hang),
            FakeListener::new("quick", 1002, Behavior::Drain(Duration::ZERO)),
        ];
        let timeout = Duration::from_millis(300);
        let report = ShutdownCoordinator::new(timeout)
            .shutdown_all(&listeners, CancellationToken::new())
            .await;

        assert!(report.elapsed >= timeout);
        assert!(report.elapsed < timeout + Duration::from_millis(500));
        assert!(report.get("quick").unwrap().is_ok());
        assert_eq!(
            report.get("stuck").unwrap().error,
            Some(ShutdownError::DeadlineExceeded { connections: 1 })
        );
    }

    #[tokio::test]
    async fn listeners_drain_concurrently() {
        let listeners = vec![
            FakeListener::new("a", 1001, Behavior::Drain(Duration::from_millis(80))),
            FakeListener::new("b", 1002, Behavior::Drain(Duration::from_millis(80))),
            FakeListener::new("c", 1003, Behavior::Drain(Duration::from_millis(80))),
        ];
        let report = ShutdownCoordinator::new(Duration::from_secs(2))
            .shutdown_all(&listeners, CancellationToken::new())
            .await;

        assert!(!report.any_failed());
        assert!(report.elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn force_cuts_the_wait_short() {
        let listeners = vec![FakeListener::new("stuck", 1001, Behavior::Hang)];
        let force = CancellationToken::new();
        let canceller = force.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = ShutdownCoordinator::new(Duration::from_secs(30))
            .shutdown_all(&listeners, force)
            .await;

        assert!(report.elapsed < Duration::from_secs(5));
        assert_eq!(
            report.get("stuck").unwrap().error,
            Some(ShutdownError::Forced { connections: 1 })
        );
    }

    #[tokio::test]
    async fn panicking_shutdown_is_still_counted() {
        let listeners = vec![
            FakeListener::new("boom", 1001, Behavior::Panic),
            FakeListener::new("fine", 1002, Behavior::Drain(Duration::ZERO)),
        ];
        let report = ShutdownCoordinator::new(Duration::from_secs(2))
            .shutdown_all(&listeners, CancellationToken::new())
            .await;

        assert_eq!(report.len(), 2);
        assert_eq!(report.get("boom").unwrap().error, Some(ShutdownError::Panicked));
        assert!(report.get("fine").unwrap().is_ok());
    }
}
