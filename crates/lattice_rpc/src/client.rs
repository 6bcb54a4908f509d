//! RPC client: target resolution, pooled connections, one blocking round
//! trip per call.
//!
//! A call holds its connection exclusively for the full request/response
//! exchange; throughput across concurrent calls comes from the pool holding
//! several connections per endpoint, never from multiplexing one stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::frame::{self, FrameError, ResponseFrame, DEFAULT_MAX_FRAME_LEN};
use crate::pool::{ConnectionPool, DEFAULT_DIAL_TIMEOUT, DEFAULT_MAX_IDLE_AGE, DEFAULT_MAX_IDLE_PER_ENDPOINT};
use crate::resolver::{self, RoundRobin, ServiceResolver};

/// Bound on one full call round trip unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tuning knobs for [`RpcClient`]. `..Default::default()` is the intended
/// way to set just one of them.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Idle connections kept per endpoint.
    pub max_idle_per_endpoint: usize,
    /// Timeout for establishing a new connection.
    pub dial_timeout: Duration,
    /// Bound on a full send+receive round trip; `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Idle connections older than this are discarded; `None` keeps all.
    pub max_idle_age: Option<Duration>,
    /// Inbound response frame size guard.
    pub max_frame_len: usize,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_endpoint: DEFAULT_MAX_IDLE_PER_ENDPOINT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            max_idle_age: Some(DEFAULT_MAX_IDLE_AGE),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// A connection-pooling RPC client with optional service discovery.
///
/// Targets that are already literal `host:port` addresses bypass the
/// resolver entirely, which keeps direct addressing (and tests) free of any
/// discovery backend.
pub struct RpcClient {
    pool: ConnectionPool,
    resolver: Option<Arc<dyn ServiceResolver>>,
    round_robin: RoundRobin,
    call_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl RpcClient {
    /// Creates a client. `resolver` may be `None` when every target will be
    /// a direct address.
    pub fn new(resolver: Option<Arc<dyn ServiceResolver>>, config: RpcClientConfig) -> Self {
        Self {
            pool: ConnectionPool::new(
                config.max_idle_per_endpoint,
                config.dial_timeout,
                config.max_idle_age,
            ),
            resolver,
            round_robin: RoundRobin::new(),
            call_timeout: config.call_timeout,
            max_frame_len: config.max_frame_len,
        }
    }

    /// Performs one synchronous call: resolve, connect (or reuse), send the
    /// request frame, read the response frame.
    ///
    /// A non-empty error string in the response comes back as
    /// [`RpcError::Application`] and leaves the connection pooled; any
    /// transport failure closes the connection and names the failing phase.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let endpoint = self.resolve_target(target).await?;
        debug!("calling method '{method}' on '{target}' at {endpoint}");

        let stream = self.pool.get(&endpoint).await?;

        let round_trip = self.round_trip(stream, &endpoint, method, payload);
        let result = match self.call_timeout {
            Some(bound) => match tokio::time::timeout(bound, round_trip).await {
                Ok(result) => result,
                Err(_) => {
                    // The round-trip future owned the stream; dropping it
                    // closed the connection.
                    warn!("call to method '{method}' at {endpoint} timed out after {bound:?}");
                    return Err(RpcError::CallTimeout {
                        method: method.to_string(),
                        endpoint: endpoint.clone(),
                        timeout: bound,
                    });
                }
            },
            None => round_trip.await,
        };

        let (stream, response) = result?;
        // The wire exchange succeeded either way, so the connection goes
        // back to the pool even when the server reports an error.
        self.pool.put_back(&endpoint, stream).await;

        if !response.error.is_empty() {
            return Err(RpcError::Application {
                service: target.to_string(),
                method: method.to_string(),
                endpoint,
                message: response.error,
            });
        }

        debug!("call to method '{method}' at {endpoint} succeeded");
        Ok(response.payload)
    }

    /// Closes every idle pooled connection; intended for process shutdown.
    pub async fn close_all_connections(&self) {
        self.pool.close_all().await;
    }

    async fn resolve_target(&self, target: &str) -> Result<String, RpcError> {
        if resolver::is_host_port(target) {
            debug!("target '{target}' is a direct address, bypassing discovery");
            return Ok(target.to_string());
        }

        let resolver = self.resolver.as_ref().ok_or_else(|| RpcError::NoResolver {
            target: target.to_string(),
        })?;
        let instances = resolver.resolve(target).await?;
        let chosen = self
            .round_robin
            .pick(target, &instances)
            .await
            .ok_or_else(|| RpcError::NoInstances {
                service: target.to_string(),
            })?;
        Ok(chosen.to_string())
    }

    /// Writes the request and reads the response on `stream`. Ownership of
    /// the stream passes through: it only comes back on success, so every
    /// error path leaves the connection closed.
    async fn round_trip(
        &self,
        mut stream: TcpStream,
        endpoint: &str,
        method: &str,
        payload: &[u8],
    ) -> Result<(TcpStream, ResponseFrame), RpcError> {
        let encoded = frame::encode_request(method, payload)?;
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| RpcError::Send {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
                source: e,
            })?;

        match frame::read_response(&mut stream, self.max_frame_len).await {
            Ok(Some(response)) => Ok((stream, response)),
            Ok(None) => Err(RpcError::Receive {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server before response",
                ),
            }),
            Err(FrameError::Io(e)) => Err(RpcError::Receive {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
                source: e,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logical_names_require_a_resolver() {
        let client = RpcClient::new(None, RpcClientConfig::default());
        let err = client.call("roomserver", "Ping", b"").await.unwrap_err();
        assert!(matches!(err, RpcError::NoResolver { target } if target == "roomserver"));
    }
}
