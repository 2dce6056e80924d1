//! Exactly-once release of shared resources.
//!
//! # Responsibilities
//! - Guard each resource's close behind a once-cell
//! - Tear resources down in a fixed order: database, cache, telemetry, logs
//!
//! # Design Decisions
//! - Every caller of `close()` sees the result of the first attempt
//! - A failing step never prevents the later steps
//! - `SharedResources` also tears down on drop, so an abandoned lifecycle
//!   still releases its pools

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::lifecycle::trigger::panic_message;
use crate::observability::{logging, metrics, Telemetry};

/// Error reported by a resource's close operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CloseError {
    message: String,
}

impl CloseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A shared resource with a fallible close, such as a connection pool.
pub trait Closeable: Send + Sync {
    fn close(&self) -> Result<(), CloseError>;
}

/// Once-guarded close of a single resource.
pub struct ResourceCloser {
    name: &'static str,
    resource: Arc<dyn Closeable>,
    outcome: OnceLock<Result<(), CloseError>>,
}

impl std::fmt::Debug for ResourceCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCloser")
            .field("name", &self.name)
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

impl ResourceCloser {
    pub fn new(name: &'static str, resource: Arc<dyn Closeable>) -> Self {
        Self {
            name,
            resource,
            outcome: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Close the resource, at most once.
    ///
    /// Concurrent callers block until the first attempt finishes and then
    /// receive its result.
    pub fn close(&self) -> Result<(), CloseError> {
        self.outcome.get_or_init(|| self.close_once()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.get().is_some()
    }

    fn close_once(&self) -> Result<(), CloseError> {
        tracing::info!(resource = self.name, "Closing connections");

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.resource.close())) {
            Ok(result) => result,
            Err(payload) => Err(CloseError::new(format!(
                "close panicked: {}",
                panic_message(&*payload)
            ))),
        };

        if let Err(e) = &result {
            tracing::error!(resource = self.name, error = %e, "Error closing connections");
        }
        metrics::record_resource_close(self.name, result.is_ok());
        result
    }
}

/// Results of a teardown pass. `None` means the resource was not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub database: Option<Result<(), CloseError>>,
    pub cache: Option<Result<(), CloseError>>,
}

impl TeardownReport {
    pub fn any_failed(&self) -> bool {
        [&self.database, &self.cache]
            .into_iter()
            .any(|outcome| matches!(outcome, Some(Err(_))))
    }
}

/// Resources shared by every listener, released once at the end.
#[derive(Debug)]
pub struct SharedResources {
    database: Option<ResourceCloser>,
    cache: Option<ResourceCloser>,
    telemetry: Telemetry,
    report: OnceLock<TeardownReport>,
}

impl SharedResources {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            database: None,
            cache: None,
            telemetry,
            report: OnceLock::new(),
        }
    }

    pub fn with_database(mut self, pool: Arc<dyn Closeable>) -> Self {
        self.database = Some(ResourceCloser::new("database", pool));
        self
    }

    pub fn with_cache(mut self, pool: Arc<dyn Closeable>) -> Self {
        self.cache = Some(ResourceCloser::new("cache", pool));
        self
    }

    pub fn database(&self) -> Option<&ResourceCloser> {
        self.database.as_ref()
    }

    pub fn cache(&self) -> Option<&ResourceCloser> {
        self.cache.as_ref()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Release everything in order. Safe to call from several paths; only
    /// the first call does any work, later ones return the same report.
    pub fn teardown(&self, panic: Option<&str>) -> TeardownReport {
        if let Some(message) = panic {
            tracing::error!(panic = %message, "Server recovered from panic");
        }

        self.report
            .get_or_init(|| {
                let report = TeardownReport {
                    database: self.database.as_ref().map(ResourceCloser::close),
                    cache: self.cache.as_ref().map(ResourceCloser::close),
                };
                self.telemetry.shutdown();
                tracing::info!(failed = report.any_failed(), "Shared resources released");
                logging::flush();
                report
            })
            .clone()
    }
}

impl Drop for SharedResources {
    fn drop(&mut self) {
        self.teardown(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Recorder {
        fn new(name: &'static str, fail: bool, order: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
                order: Arc::clone(order),
            })
        }
    }

    impl Closeable for Recorder {
        fn close(&self) -> Result<(), CloseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name);
            std::thread::sleep(Duration::from_millis(5));
            if self.fail {
                Err(CloseError::new(format!("{} refused to close", self.name)))
            } else {
                Ok(())
            }
        }
    }

    struct Exploding;

    impl Closeable for Exploding {
        fn close(&self) -> Result<(), CloseError> {
            panic!("pool poisoned");
        }
    }

    #[test]
    fn close_runs_once_and_repeats_first_result() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pool = Recorder::new("database", true, &order);
        let closer = ResourceCloser::new("database", pool.clone());

        assert!(!closer.is_closed());
        let first = closer.close();
        let second = closer.close();

        assert_eq!(pool.calls.load(Ordering::SeqCst), 1);
        assert!(first.is_err());
        assert_eq!(first, second);
        assert!(closer.is_closed());
    }

    #[test]
    fn concurrent_close_runs_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pool = Recorder::new("cache", false, &order);
        let closer = ResourceCloser::new("cache", pool.clone());

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| closer.close())).collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), Ok(()));
            }
        });

        assert_eq!(pool.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_close_becomes_an_error() {
        let closer = ResourceCloser::new("database", Arc::new(Exploding));
        let result = closer.close();
        assert_eq!(result, Err(CloseError::new("close panicked: pool poisoned")));
        assert_eq!(closer.close(), result);
    }

    #[test]
    fn teardown_order_and_failure_isolation() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let database = Recorder::new("database", true, &order);
        let cache = Recorder::new("cache", false, &order);

        let resources = SharedResources::new(Telemetry::disabled())
            .with_cache(cache.clone())
            .with_database(database.clone());

        let report = resources.teardown(None);
        assert_eq!(*order.lock().unwrap(), vec!["database", "cache"]);
        assert!(matches!(report.database, Some(Err(_))));
        assert_eq!(report.cache, Some(Ok(())));
        assert!(report.any_failed());
    }

    #[test]
    fn teardown_from_two_paths_closes_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let database = Recorder::new("database", false, &order);
        let cache = Recorder::new("cache", false, &order);

        let resources = SharedResources::new(Telemetry::disabled())
            .with_database(database.clone())
            .with_cache(cache.clone());

        let normal = resources.teardown(None);
        let recovered = resources.teardown(Some("handler blew up"));
        drop(resources);

        assert_eq!(normal, recovered);
        assert_eq!(database.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_resources() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let database = Recorder::new("database", false, &order);
        {
            let _resources = SharedResources::new(Telemetry::disabled()).with_database(database.clone());
        }
        assert_eq!(database.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unconfigured_resources_are_skipped() {
        let resources = SharedResources::new(Telemetry::disabled());
        let report = resources.teardown(None);
        assert_eq!(report, TeardownReport::default());
        assert!(!report.any_failed());
    }
}
