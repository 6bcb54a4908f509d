//! RPC server: handler registration, accept loop, per-connection dispatch.
//!
//! Each accepted connection gets its own task looping read → dispatch →
//! write, so one misbehaving peer never affects another. Frames from a
//! connection are answered strictly in order; pipelining across calls is a
//! client-side concern solved with more connections, not multiplexing.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::frame::{self, DEFAULT_MAX_FRAME_LEN};

/// Errors returned by method handlers. Whatever it displays as becomes the
/// error string of the response frame, verbatim.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a method handler produces: a response payload, or an application
/// error carried back to the caller in-band.
pub type HandlerResult = Result<Vec<u8>, HandlerError>;

/// Per-request context passed to handlers alongside the payload.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Address of the calling peer.
    pub peer: SocketAddr,
    /// Method name the request was dispatched under.
    pub method: String,
}

/// A registered RPC method implementation.
///
/// Usually not implemented by hand; [`RpcServer::register_handler`] accepts
/// any async closure of the right shape.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Vec<u8>) -> HandlerResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(RequestContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Vec<u8>) -> HandlerResult {
        (self.f)(ctx, payload).await
    }
}

type HandlerTable = Arc<RwLock<HashMap<String, Arc<dyn MethodHandler>>>>;

/// A length-prefixed-frame RPC server.
///
/// Lifecycle: `register_handler` any number of methods, `listen` (or
/// `bind` + `serve` when the caller needs the ephemeral port first), and
/// `close` to resolve the accept loop with `Ok(())`.
pub struct RpcServer {
    handlers: HandlerTable,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    max_frame_len: usize,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Creates a server with a custom inbound frame-size guard.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
            max_frame_len,
        }
    }

    /// Registers a handler for `method`. Re-registering a name overwrites
    /// the previous handler; last registration wins.
    pub async fn register_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(RequestContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        if handlers
            .insert(method.to_string(), Arc::new(FnHandler { f: handler }))
            .is_some()
        {
            warn!("replacing existing handler for method '{method}'");
        } else {
            info!("registered handler for method '{method}'");
        }
    }

    /// Binds the listening socket without starting to accept, returning the
    /// bound address. Lets callers use `:0` and learn the real port.
    pub async fn bind(&self, addr: &str) -> Result<SocketAddr, RpcError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| RpcError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local = listener.local_addr().map_err(|e| RpcError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        *self.listener.lock().await = Some(listener);
        *self.local_addr.lock().await = Some(local);
        Ok(local)
    }

    /// The address `bind` produced, if the server is bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Binds `addr` and serves until [`close`](Self::close) is called
    /// (resolving to `Ok(())`) or the accept loop fails permanently.
    pub async fn listen(&self, addr: &str) -> Result<(), RpcError> {
        self.bind(addr).await?;
        self.serve().await
    }

    /// Runs the accept loop on the already-bound listener.
    ///
    /// Transient accept errors are logged and the loop continues; anything
    /// else ends the loop with an error. `close` ends it with `Ok(())`.
    pub async fn serve(&self) -> Result<(), RpcError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(RpcError::NotBound)?;
        let local = listener.local_addr().map_err(|e| RpcError::Accept { source: e })?;
        info!("rpc server listening on {local}");

        let mut shutdown_rx = self.shutdown.subscribe();
        // A close that raced the subscription above must still win.
        if self.closed.load(Ordering::Acquire) {
            info!("rpc server listener on {local} closed");
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("rpc server listener on {local} closed");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let handlers = self.handlers.clone();
                        let max_frame_len = self.max_frame_len;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, handlers, max_frame_len).await;
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("transient accept error on {local}: {e}");
                    }
                    Err(e) => {
                        error!("permanent accept error on {local}: {e}");
                        return Err(RpcError::Accept { source: e });
                    }
                }
            }
        }
    }

    /// Stops the accept loop. Connections already accepted keep running
    /// until their peers hang up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown.send(());
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Serves one connection: read a request, dispatch it, write the response,
/// repeat until the peer closes or framing breaks.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handlers: HandlerTable,
    max_frame_len: usize,
) {
    loop {
        let request = match frame::read_request(&mut stream, max_frame_len).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("connection closed by peer {peer}");
                break;
            }
            Err(e) => {
                warn!("dropping connection from {peer}: {e}");
                break;
            }
        };

        let method = request.method;
        debug!(
            "request for method '{method}' with {} payload byte(s) from {peer}",
            request.payload.len()
        );

        let handler = handlers.read().await.get(&method).cloned();
        let (error, payload) = match handler {
            None => {
                let message = format!("no coordinator found for method: {method}");
                warn!("{message} (peer {peer})");
                (message, Vec::new())
            }
            Some(handler) => {
                let ctx = RequestContext {
                    peer,
                    method: method.clone(),
                };
                match handler.handle(ctx, request.payload).await {
                    Ok(payload) => (String::new(), payload),
                    Err(e) => {
                        warn!("handler for method '{method}' returned error: {e}");
                        (e.to_string(), Vec::new())
                    }
                }
            }
        };

        let encoded = match frame::encode_response(&error, &payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode response for method '{method}': {e}");
                break;
            }
        };
        if let Err(e) = stream.write_all(&encoded).await {
            warn!("failed to write response for method '{method}' to {peer}: {e}");
            break;
        }
        debug!(
            "sent response for method '{method}' to {peer} (error: '{error}', {} payload byte(s))",
            payload.len()
        );
    }
    debug!("closing connection from {peer}");
}
