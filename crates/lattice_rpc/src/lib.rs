//! # Lattice RPC - Inter-Service Transport
//!
//! The binary RPC transport every Lattice microservice uses to talk to its
//! peers: a length-prefixed wire protocol, a bounded per-endpoint
//! connection pool, pluggable service discovery, and the server dispatch
//! loop.
//!
//! ## Architecture Overview
//!
//! * **Frame codec** — symmetric encode/decode of request and response
//!   frames ([`frame`])
//! * **Connection pool** — bounded reuse of TCP connections per endpoint
//!   ([`pool`])
//! * **Service resolution** — logical name → endpoints, with round-robin
//!   selection and a literal `host:port` bypass ([`resolver`])
//! * **Server** — handler table plus one dispatch task per accepted
//!   connection ([`server`])
//! * **Client** — one pooled connection per in-flight call, application
//!   errors carried in-band ([`client`])
//!
//! ## Call Flow
//!
//! 1. A caller hands [`RpcClient::call`] a target, method name, and an
//!    already-serialized payload
//! 2. The target resolves to an endpoint (directly, or via the resolver)
//! 3. A pooled connection carries one request frame and one response frame
//! 4. The response payload (or a descriptive error) returns to the caller
//!    and the connection is re-pooled or closed depending on its health
//!
//! Payloads are opaque bytes end to end; serialization to typed messages
//! belongs to the call sites, not this crate.

pub use client::{RpcClient, RpcClientConfig, DEFAULT_CALL_TIMEOUT};
pub use error::RpcError;
pub use frame::{FrameError, RequestFrame, ResponseFrame, DEFAULT_MAX_FRAME_LEN};
pub use pool::{
    ConnectionPool, DEFAULT_DIAL_TIMEOUT, DEFAULT_MAX_IDLE_AGE, DEFAULT_MAX_IDLE_PER_ENDPOINT,
};
pub use resolver::{Endpoint, RoundRobin, ServiceResolver, StaticResolver};
pub use server::{HandlerError, HandlerResult, MethodHandler, RequestContext, RpcServer};

pub mod client;
pub mod error;
pub mod frame;
pub mod pool;
pub mod resolver;
pub mod server;
