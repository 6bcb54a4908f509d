//! Bounded per-endpoint pooling of TCP connections.
//!
//! A connection belongs to exactly one pool slot at a time; while a call is
//! in flight the stream is owned by the caller and the pool has no record
//! of it. The lock guards only the map of idle connections, never any I/O.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RpcError;

/// Maximum idle connections kept per endpoint unless configured otherwise.
pub const DEFAULT_MAX_IDLE_PER_ENDPOINT: usize = 10;
/// Dial timeout applied when the pool has to open a fresh connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle connections older than this are discarded instead of reused.
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(60);

struct IdleConn {
    stream: TcpStream,
    parked_at: Instant,
}

/// A pool of reusable connections keyed by `host:port` endpoint address.
///
/// Connections are handed out without a liveness probe; the idle-age bound
/// below is the only staleness defense. A connection that turns out to be
/// broken mid-call must be dropped by the caller, not returned.
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, VecDeque<IdleConn>>>,
    max_idle_per_endpoint: usize,
    dial_timeout: Duration,
    max_idle_age: Option<Duration>,
}

impl ConnectionPool {
    /// Creates a pool. Zero `max_idle_per_endpoint` or `dial_timeout`
    /// fall back to the defaults; `max_idle_age: None` disables eviction.
    pub fn new(
        max_idle_per_endpoint: usize,
        dial_timeout: Duration,
        max_idle_age: Option<Duration>,
    ) -> Self {
        let max_idle_per_endpoint = if max_idle_per_endpoint == 0 {
            DEFAULT_MAX_IDLE_PER_ENDPOINT
        } else {
            max_idle_per_endpoint
        };
        let dial_timeout = if dial_timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            dial_timeout
        };
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_endpoint,
            dial_timeout,
            max_idle_age,
        }
    }

    /// Pops an idle connection for `endpoint`, or dials a new one.
    ///
    /// Reuse is newest-first; anything parked longer than the idle-age
    /// bound is dropped on the way. Dialing happens outside the pool lock.
    pub async fn get(&self, endpoint: &str) -> Result<TcpStream, RpcError> {
        {
            let mut idle = self.idle.lock().await;
            if let Some(queue) = idle.get_mut(endpoint) {
                while let Some(conn) = queue.pop_back() {
                    if let Some(max_age) = self.max_idle_age {
                        if conn.parked_at.elapsed() > max_age {
                            debug!("discarding stale idle connection to {endpoint}");
                            continue;
                        }
                    }
                    debug!("reusing pooled connection to {endpoint}");
                    return Ok(conn.stream);
                }
            }
        }

        debug!("no idle connection for {endpoint}, dialing");
        let stream = timeout(self.dial_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| RpcError::DialTimeout {
                endpoint: endpoint.to_string(),
                timeout: self.dial_timeout,
            })?
            .map_err(|e| RpcError::Dial {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
        debug!("dialed new connection to {endpoint}");
        Ok(stream)
    }

    /// Parks a connection for reuse, or closes it when the endpoint's pool
    /// is already at capacity.
    pub async fn put_back(&self, endpoint: &str, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        let queue = idle.entry(endpoint.to_string()).or_default();
        if queue.len() >= self.max_idle_per_endpoint {
            warn!("pool for {endpoint} is full, closing surplus connection");
            return; // dropping the stream closes it
        }
        queue.push_back(IdleConn {
            stream,
            parked_at: Instant::now(),
        });
        debug!("connection returned to pool for {endpoint}");
    }

    /// Closes every idle connection and discards all pool state. A later
    /// `get` transparently rebuilds the per-endpoint state, so this is safe
    /// to race with in-flight calls.
    pub async fn close_all(&self) {
        let mut idle = self.idle.lock().await;
        let endpoints = idle.len();
        idle.clear();
        debug!("closed idle connections for {endpoints} endpoint(s)");
    }
}
