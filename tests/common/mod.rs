//! Shared utilities for lifecycle integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use listenerd::lifecycle::{
    CloseError, Closeable, Completion, Lifecycle, LifecycleState, SharedResources, SignalChannel,
    SignalSender, Status,
};
use listenerd::net::ListenerSpec;
use listenerd::observability::Telemetry;
use listenerd::BuildInfo;

/// A resource that counts how often it was closed.
#[derive(Default)]
pub struct CountingResource {
    closes: AtomicUsize,
    fail: bool,
}

impl CountingResource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            closes: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Closeable for CountingResource {
    fn close(&self) -> Result<(), CloseError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(CloseError::new("refused"))
        } else {
            Ok(())
        }
    }
}

/// Database and cache stand-ins.
pub struct Resources {
    pub database: Arc<CountingResource>,
    pub cache: Arc<CountingResource>,
}

impl Resources {
    pub fn new() -> Self {
        Self {
            database: CountingResource::new(),
            cache: CountingResource::new(),
        }
    }

    pub fn shared(&self) -> SharedResources {
        SharedResources::new(Telemetry::disabled())
            .with_database(self.database.clone())
            .with_cache(self.cache.clone())
    }

    pub fn assert_closed_once(&self) {
        assert_eq!(self.database.closes(), 1, "database closes");
        assert_eq!(self.cache.closes(), 1, "cache closes");
    }
}

/// A plaintext listener on an ephemeral localhost port.
pub fn plain(name: &str) -> ListenerSpec {
    ListenerSpec::plain(name, "127.0.0.1", 0)
}

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// Routes used to exercise draining and panics.
pub fn test_router() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "done"
            }),
        )
        .route(
            "/stuck",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "never"
            }),
        )
        .route("/boom", get(boom))
}

async fn boom() -> &'static str {
    panic!("handler exploded")
}

pub fn lifecycle(
    listeners: Vec<ListenerSpec>,
    resources: SharedResources,
    timeout: Duration,
) -> Lifecycle {
    Lifecycle::new(
        listeners,
        test_router(),
        resources,
        timeout,
        BuildInfo::new("0.0.0-test", "test", "0000000"),
    )
}

/// A lifecycle running in the background, driven by manual signals.
pub struct Running {
    pub status: Status,
    pub signals: SignalSender,
    pub watch: tokio::sync::watch::Receiver<Status>,
    pub task: JoinHandle<Completion>,
}

impl Running {
    /// Base URL of a running listener.
    pub fn url(&self, listener: &str) -> String {
        let addr = self.status.address_of(listener).unwrap();
        format!("http://{}", addr)
    }

    pub async fn wait_for(&mut self, state: LifecycleState) {
        self.watch.wait_for(|s| s.state == state).await.unwrap();
    }

    pub async fn finish(self) -> Completion {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("lifecycle did not finish")
            .unwrap()
    }
}

/// Spawn the lifecycle and wait until it serves or fails to start.
pub async fn launch(lifecycle: Lifecycle) -> Running {
    let mut watch = lifecycle.watch();
    let channel = SignalChannel::manual();
    let signals = channel.sender();
    let task = tokio::spawn(lifecycle.run_with_signals(channel));

    let status = watch
        .wait_for(|s| s.state != LifecycleState::Initializing)
        .await
        .map(|s| s.clone())
        .unwrap_or_else(|_| Status {
            state: LifecycleState::Initializing,
            listeners: Vec::new(),
        });

    Running {
        status,
        signals,
        watch,
        task,
    }
}

/// A TCP backend that accepts connections and holds them open.
pub async fn start_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr.to_string()
}
