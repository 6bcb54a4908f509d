//! Error types for the RPC transport layer.
//!
//! The variants map onto the failure taxonomy callers need to distinguish:
//! resolution failures (no connection was attempted), transport failures
//! (the request may not have reached the server), and application failures
//! (the request reached the server and the server said no).

use std::time::Duration;

use crate::frame::FrameError;

/// Errors produced by the RPC client and server.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Service discovery failed for a logical service name.
    #[error("failed to resolve service '{service}': {reason}")]
    Resolve { service: String, reason: String },

    /// Discovery succeeded but returned zero live instances.
    #[error("no instances found for service '{service}'")]
    NoInstances { service: String },

    /// A logical service name was used but the client has no resolver.
    #[error("no resolver configured and '{target}' is not a host:port address")]
    NoResolver { target: String },

    /// Establishing a new connection failed.
    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        endpoint: String,
        source: std::io::Error,
    },

    /// Establishing a new connection did not complete within the dial timeout.
    #[error("timed out dialing {endpoint} after {timeout:?}")]
    DialTimeout { endpoint: String, timeout: Duration },

    /// Writing the request frame failed; the request may not have reached
    /// the server. The connection is discarded.
    #[error("failed to send request for method '{method}' to {endpoint}: {source}")]
    Send {
        method: String,
        endpoint: String,
        source: std::io::Error,
    },

    /// Reading the response frame failed after the request was sent. The
    /// connection is discarded.
    #[error("failed to read response for method '{method}' from {endpoint}: {source}")]
    Receive {
        method: String,
        endpoint: String,
        source: std::io::Error,
    },

    /// The full round trip did not complete within the call timeout. The
    /// connection is discarded.
    #[error("call to method '{method}' on {endpoint} timed out after {timeout:?}")]
    CallTimeout {
        method: String,
        endpoint: String,
        timeout: Duration,
    },

    /// A malformed frame was observed on the wire. Fatal to the connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The server delivered a response frame carrying a non-empty error
    /// string. The wire protocol succeeded; the connection stays healthy.
    #[error("rpc call to method '{method}' on service '{service}' at {endpoint} failed: {message}")]
    Application {
        service: String,
        method: String,
        endpoint: String,
        message: String,
    },

    /// The server could not bind its listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// The server's accept loop hit a non-recoverable error.
    #[error("accept loop failed: {source}")]
    Accept { source: std::io::Error },

    /// `serve` was called before `bind`.
    #[error("server is not bound to a listening address")]
    NotBound,
}
