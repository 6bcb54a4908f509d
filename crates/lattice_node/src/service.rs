//! Service-node wiring: one RPC server, one RPC client, and the
//! infrastructure methods every Lattice node answers.
//!
//! No game logic lives here. Business methods belong to the services built
//! on top; this node only proves out the transport (`Ping`, `Echo`,
//! `Status`) and the gateway-style forwarding path (`Relay`).

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use lattice_actor::{Actor, ActorContext, ActorId, ActorProcessor, ProcessError};
use lattice_rpc::{HandlerError, RpcClient, RpcServer, ServiceResolver};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::id::IdGenerator;
use crate::shutdown::setup_shutdown_handler;

/// A per-node session entity processed strictly one message at a time.
///
/// Deliberately minimal: it exists so the node exercises the actor path
/// end to end. Real entities (rooms, matches) follow the same shape.
struct EchoSession {
    handled: u64,
}

#[async_trait]
impl ActorProcessor for EchoSession {
    type Message = Vec<u8>;
    type Response = Vec<u8>;

    async fn process(
        &mut self,
        ctx: &ActorContext,
        message: Vec<u8>,
    ) -> Result<Vec<u8>, ProcessError> {
        self.handled += 1;
        debug!(
            "echo session {} handled message #{} ({} bytes)",
            ctx.id(),
            self.handled,
            message.len()
        );
        Ok(message)
    }
}

/// One running Lattice node: config, server, client, and its entities.
pub struct ServiceNode {
    config: AppConfig,
    server: Arc<RpcServer>,
    client: Arc<RpcClient>,
    ids: Arc<IdGenerator>,
    echo: Actor<EchoSession>,
    started_at: Instant,
}

impl ServiceNode {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let ids = Arc::new(IdGenerator::new(config.node.node_id)?);
        let resolver = config
            .build_resolver()?
            .map(|r| Arc::new(r) as Arc<dyn ServiceResolver>);
        let client = Arc::new(RpcClient::new(resolver, config.client_config()));
        let server = Arc::new(RpcServer::with_max_frame_len(config.rpc.max_frame_len));
        let echo = Actor::spawn(
            ActorId(ids.next()),
            format!("{}-echo", config.node.name),
            EchoSession { handled: 0 },
            config.actors.mailbox_capacity,
        );

        Ok(Self {
            config,
            server,
            client,
            ids,
            echo,
            started_at: Instant::now(),
        })
    }

    /// Registers the infrastructure methods every node exposes.
    async fn register_handlers(&self) {
        self.server
            .register_handler("Ping", |_ctx, payload| async move {
                let mut reply = b"Pong: ".to_vec();
                reply.extend_from_slice(&payload);
                Ok(reply)
            })
            .await;

        // Echo runs through the session actor so payloads from concurrent
        // connections are observed strictly one at a time.
        let echo = self.echo.clone();
        self.server
            .register_handler("Echo", move |_ctx, payload| {
                let echo = echo.clone();
                async move {
                    echo.ask(payload)
                        .await
                        .map_err(|e| Box::new(e) as HandlerError)
                }
            })
            .await;

        let name = self.config.node.name.clone();
        let node_id = self.config.node.node_id;
        let ids = self.ids.clone();
        let started_at = self.started_at;
        self.server
            .register_handler("Status", move |_ctx, _payload| {
                let name = name.clone();
                let ids = ids.clone();
                async move {
                    let status = serde_json::json!({
                        "node": name,
                        "node_id": node_id,
                        "uptime_secs": started_at.elapsed().as_secs(),
                        "status_id": ids.next(),
                    });
                    serde_json::to_vec(&status).map_err(|e| Box::new(e) as HandlerError)
                }
            })
            .await;

        // Gateway-style forwarding: "target|method|payload" is re-issued
        // through this node's client and the peer's response relayed back.
        let client = self.client.clone();
        self.server
            .register_handler("Relay", move |_ctx, payload| {
                let client = client.clone();
                async move {
                    let (target, method, inner) = split_relay(&payload)
                        .ok_or("relay payload must be 'target|method|payload'")?;
                    client
                        .call(&target, &method, inner)
                        .await
                        .map_err(|e| Box::new(e) as HandlerError)
                }
            })
            .await;
    }

    /// Runs the node until a termination signal arrives, then shuts every
    /// component down in order.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.register_handlers().await;

        let addr = self
            .server
            .bind(&self.config.node.bind_address)
            .await
            .context("failed to bind rpc server")?;
        info!("✅ node '{}' serving rpc on {addr}", self.config.node.name);

        let server = self.server.clone();
        let serve_task = tokio::spawn(async move { server.serve().await });

        let shutdown = setup_shutdown_handler();
        let _ = shutdown.await;

        info!("🛑 shutting down node '{}'", self.config.node.name);
        self.server.close();
        serve_task
            .await
            .context("accept loop task panicked")?
            .context("accept loop failed")?;

        self.echo.stop().await;
        self.client.close_all_connections().await;
        info!("node '{}' stopped", self.config.node.name);
        Ok(())
    }
}

fn split_relay(payload: &[u8]) -> Option<(String, String, &[u8])> {
    let mut parts = payload.splitn(3, |b| *b == b'|');
    let target = std::str::from_utf8(parts.next()?).ok()?;
    let method = std::str::from_utf8(parts.next()?).ok()?;
    let inner = parts.next().unwrap_or(b"");
    if target.is_empty() || method.is_empty() {
        return None;
    }
    Some((target.to_string(), method.to_string(), inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_rpc::{RpcClient, RpcClientConfig};

    fn test_config(bind: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.node.bind_address = bind.to_string();
        config
    }

    /// Brings a node's handlers up on an ephemeral port without the signal
    /// loop, returning the bound address.
    async fn start_node(node: &ServiceNode) -> String {
        node.register_handlers().await;
        let addr = node.server.bind(&node.config.node.bind_address).await.unwrap();
        let server = node.server.clone();
        tokio::spawn(async move { server.serve().await });
        addr.to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn node_answers_ping_echo_and_status() {
        let node = ServiceNode::new(test_config("127.0.0.1:0")).unwrap();
        let addr = start_node(&node).await;
        let client = RpcClient::new(None, RpcClientConfig::default());

        let reply = client.call(&addr, "Ping", b"Hello RPC").await.unwrap();
        assert_eq!(reply, b"Pong: Hello RPC");

        let reply = client.call(&addr, "Echo", b"through the actor").await.unwrap();
        assert_eq!(reply, b"through the actor");

        let status = client.call(&addr, "Status", b"").await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&status).unwrap();
        assert_eq!(status["node"], "lattice-node");
        assert!(status["status_id"].as_i64().unwrap() > 0);

        node.server.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn relay_forwards_to_the_target_node() {
        let backend = ServiceNode::new(test_config("127.0.0.1:0")).unwrap();
        let backend_addr = start_node(&backend).await;

        let gateway = ServiceNode::new(test_config("127.0.0.1:0")).unwrap();
        let gateway_addr = start_node(&gateway).await;

        let client = RpcClient::new(None, RpcClientConfig::default());
        let mut relay_payload = format!("{backend_addr}|Ping|").into_bytes();
        relay_payload.extend_from_slice(b"via gateway");

        let reply = client
            .call(&gateway_addr, "Relay", &relay_payload)
            .await
            .unwrap();
        assert_eq!(reply, b"Pong: via gateway");

        // Malformed relay payloads come back as application errors.
        let err = client
            .call(&gateway_addr, "Relay", b"no separators here")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("relay payload"));

        backend.server.close();
        gateway.server.close();
    }
}
