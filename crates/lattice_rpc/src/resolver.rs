//! Service resolution: mapping logical service names to live endpoints.
//!
//! The registry backend itself (Consul, etcd, a gossip mesh) lives outside
//! this crate; callers hand the client anything implementing
//! [`ServiceResolver`]. [`StaticResolver`] covers tests and fixed-topology
//! deployments.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::RpcError;

/// A resolved (host, port) pair identifying one reachable server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps a logical service name to the set of live endpoints serving it.
///
/// An empty instance list must be reported as [`RpcError::NoInstances`],
/// never as an empty success.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, RpcError>;
}

/// Returns true when `target` is already a literal `host:port` address, in
/// which case discovery is bypassed entirely. Accepts any non-empty host
/// (including a bracketed IPv6 literal) followed by a numeric port.
pub fn is_host_port(target: &str) -> bool {
    match target.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Round-robin selection state, one counter per service name.
///
/// Counters only ever increase and are not reset when the instance count
/// changes, so the starting offset drifts as topology changes. Selection
/// stays approximately fair, which is all the balancing this layer promises.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: Mutex<HashMap<String, u64>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next instance for `service`, advancing its counter.
    /// Returns `None` on an empty instance list.
    pub async fn pick<'a>(
        &self,
        service: &str,
        instances: &'a [Endpoint],
    ) -> Option<&'a Endpoint> {
        if instances.is_empty() {
            return None;
        }
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(service.to_string()).or_insert(0);
        let chosen = &instances[(*counter % instances.len() as u64) as usize];
        *counter += 1;
        Some(chosen)
    }
}

/// A fixed name → endpoints table.
///
/// Used by tests and by nodes whose topology comes from configuration
/// rather than a discovery backend.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    table: HashMap<String, Vec<Endpoint>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the endpoint list for a service name.
    pub fn with_service(mut self, name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        self.table.insert(name.into(), endpoints);
        self
    }
}

#[async_trait]
impl ServiceResolver for StaticResolver {
    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, RpcError> {
        match self.table.get(service) {
            Some(endpoints) if !endpoints.is_empty() => Ok(endpoints.clone()),
            _ => Err(RpcError::NoInstances {
                service: service.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_literals_are_recognized() {
        assert!(is_host_port("127.0.0.1:8080"));
        assert!(is_host_port("localhost:50051"));
        assert!(is_host_port("[::1]:9000"));

        assert!(!is_host_port("roomserver"));
        assert!(!is_host_port(":8080"));
        assert!(!is_host_port("host:"));
        assert!(!is_host_port("host:notaport"));
        assert!(!is_host_port("host:99999"));
    }

    #[tokio::test]
    async fn round_robin_cycles_in_order() {
        let rr = RoundRobin::new();
        let instances = vec![
            Endpoint::new("10.0.0.1", 1),
            Endpoint::new("10.0.0.2", 2),
            Endpoint::new("10.0.0.3", 3),
        ];

        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(rr.pick("game", &instances).await.unwrap().port);
        }
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn round_robin_counters_are_per_service() {
        let rr = RoundRobin::new();
        let a = vec![Endpoint::new("a", 1), Endpoint::new("a", 2)];
        let b = vec![Endpoint::new("b", 1), Endpoint::new("b", 2)];

        assert_eq!(rr.pick("game", &a).await.unwrap().port, 1);
        assert_eq!(rr.pick("room", &b).await.unwrap().port, 1);
        assert_eq!(rr.pick("game", &a).await.unwrap().port, 2);
    }

    #[tokio::test]
    async fn round_robin_counter_survives_instance_count_changes() {
        let rr = RoundRobin::new();
        let three = vec![
            Endpoint::new("a", 1),
            Endpoint::new("a", 2),
            Endpoint::new("a", 3),
        ];
        for _ in 0..4 {
            rr.pick("game", &three).await;
        }
        // Counter is now 4; with two instances the offset continues from
        // 4 % 2 rather than restarting.
        let two = vec![Endpoint::new("a", 1), Endpoint::new("a", 2)];
        assert_eq!(rr.pick("game", &two).await.unwrap().port, 1);
        assert_eq!(rr.pick("game", &two).await.unwrap().port, 2);
    }

    #[tokio::test]
    async fn static_resolver_reports_unknown_names_as_no_instances() {
        let resolver = StaticResolver::new()
            .with_service("game", vec![Endpoint::new("127.0.0.1", 7000)]);

        let endpoints = resolver.resolve("game").await.unwrap();
        assert_eq!(endpoints.len(), 1);

        let err = resolver.resolve("pay").await.unwrap_err();
        assert!(matches!(err, RpcError::NoInstances { service } if service == "pay"));
    }
}
