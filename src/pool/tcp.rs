//! Bounded TCP connection pool.
//!
//! # Responsibilities
//! - Dial one connection eagerly so a bad address fails startup
//! - Hand out at most `max_connections` connections at a time
//! - Return released connections to the idle set
//! - Refuse to close while connections are still leased
//!
//! # Design Decisions
//! - A semaphore bounds concurrency; waiting for a permit is capped by the
//!   connect timeout
//! - Connections are returned by a drop guard, so a panicking user still
//!   gives its slot back
//! - A lease is counted from the moment a permit is held, dial included,
//!   so `close` never succeeds while a connection is being handed out

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::lifecycle::resources::{CloseError, Closeable};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} waiting for {address}")]
    Timeout { address: String, timeout: Duration },

    #[error("pool {0} is closed")]
    Closed(&'static str),
}

/// Point-in-time view of a pool, exposed by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: &'static str,
    pub address: String,
    pub max_connections: usize,
    pub idle: usize,
    pub leased: usize,
    pub closed: bool,
}

/// A bounded pool of TCP connections to one address.
#[derive(Debug)]
pub struct TcpPool {
    name: &'static str,
    address: String,
    max_connections: usize,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<TcpStream>>,
    leased: AtomicUsize,
    closed: AtomicBool,
}

impl TcpPool {
    /// Create the pool and dial its first connection.
    pub async fn connect(name: &'static str, config: &PoolConfig) -> Result<Arc<Self>, PoolError> {
        let pool = Arc::new(Self {
            name,
            address: config.address.clone(),
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout(),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(Vec::new()),
            leased: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let first = pool.dial().await?;
        pool.idle().push(first);

        tracing::info!(
            pool = name,
            address = %pool.address,
            max_connections = pool.max_connections,
            "Connection pool ready"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lease a connection, reusing an idle one when available.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.name));
        }

        let permit = tokio::time::timeout(self.connect_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::Timeout {
                address: self.address.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|_| PoolError::Closed(self.name))?;

        self.leased.fetch_add(1, Ordering::SeqCst);
        let mut lease = PooledConnection {
            stream: None,
            pool: Arc::clone(self),
            _permit: permit,
        };

        let reused = self.idle().pop();
        let stream = match reused {
            Some(stream) => stream,
            None => self.dial().await?,
        };
        lease.stream = Some(stream);

        if self.is_closed() {
            return Err(PoolError::Closed(self.name));
        }
        Ok(lease)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.name,
            address: self.address.clone(),
            max_connections: self.max_connections,
            idle: self.idle().len(),
            leased: self.leased.load(Ordering::SeqCst),
            closed: self.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn dial(&self) -> Result<TcpStream, PoolError> {
        let timeout = self.connect_timeout;
        let timed_out = || PoolError::Timeout {
            address: self.address.clone(),
            timeout,
        };

        let addr = tokio::time::timeout(timeout, tokio::net::lookup_host(self.address.as_str()))
            .await
            .map_err(|_| timed_out())?
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
                })
            })
            .map_err(|source| PoolError::Resolve {
                address: self.address.clone(),
                source,
            })?;

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out())?
            .map_err(|source| PoolError::Connect {
                address: self.address.clone(),
                source,
            })?;

        tracing::debug!(pool = self.name, address = %addr, "Connection opened");
        Ok(stream)
    }

    fn idle(&self) -> MutexGuard<'_, Vec<TcpStream>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, stream: Option<TcpStream>) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        if let Some(stream) = stream.filter(|_| !self.is_closed()) {
            self.idle().push(stream);
        }
    }
}

impl Closeable for TcpPool {
    fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CloseError::new(format!("pool {} already closed", self.name)));
        }

        self.permits.close();
        let dropped = self.idle().drain(..).count();
        let leased = self.leased.load(Ordering::SeqCst);

        tracing::debug!(pool = self.name, idle = dropped, leased, "Pool closed");

        if leased > 0 {
            return Err(CloseError::new(format!(
                "pool {} closed with {} connections still leased",
                self.name, leased
            )));
        }
        Ok(())
    }
}

/// A leased connection; returned to the pool on drop.
#[derive(Debug)]
pub struct PooledConnection {
    stream: Option<TcpStream>,
    pool: Arc<TcpPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("a handed-out lease always holds a stream"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut TcpStream {
        match &mut self.stream {
            Some(stream) => stream,
            None => unreachable!("a handed-out lease always holds a stream"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.stream.take());
    }
}
