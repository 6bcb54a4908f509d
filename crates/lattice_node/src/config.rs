//! Configuration management for a Lattice service node.
//!
//! Settings come from a TOML file (created with defaults on first run) with
//! command-line overrides applied on top. The libraries themselves never see
//! this structure; they get plain constructor parameters derived from it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use lattice_rpc::{Endpoint, RpcClientConfig, StaticResolver};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::id::MAX_NODE_ID;

/// Top-level node configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and bind settings for this node
    pub node: NodeSettings,
    /// RPC transport tuning
    #[serde(default)]
    pub rpc: RpcSettings,
    /// Actor defaults
    #[serde(default)]
    pub actors: ActorSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Static service table: logical service name -> "host:port" endpoints.
    /// Feeds the in-process resolver; leave empty when only direct
    /// addressing is used.
    #[serde(default)]
    pub services: HashMap<String, Vec<String>>,
}

/// Identity and network binding for this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Service name this node runs as (e.g. "roomserver")
    pub name: String,
    /// Address the RPC server binds to (e.g. "0.0.0.0:7300")
    pub bind_address: String,
    /// Node number used by the ID generator (0-1023, unique per node)
    #[serde(default = "default_node_id")]
    pub node_id: i64,
}

/// RPC transport tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    /// Timeout for establishing new connections, in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Bound on a full call round trip, in milliseconds (0 disables)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Idle connections kept per endpoint
    #[serde(default = "default_max_idle_per_endpoint")]
    pub max_idle_per_endpoint: usize,
    /// Idle connections older than this are discarded, in seconds (0 disables)
    #[serde(default = "default_max_idle_age_secs")]
    pub max_idle_age_secs: u64,
    /// Largest inbound frame accepted, in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

/// Actor subsystem defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSettings {
    /// Mailbox capacity for actors spawned by this node
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_node_id() -> i64 {
    1
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_max_idle_per_endpoint() -> usize {
    10
}

fn default_max_idle_age_secs() -> u64 {
    60
}

fn default_max_frame_len() -> usize {
    lattice_rpc::DEFAULT_MAX_FRAME_LEN
}

fn default_mailbox_capacity() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                name: "lattice-node".to_string(),
                bind_address: "127.0.0.1:7300".to_string(),
                node_id: default_node_id(),
            },
            rpc: RpcSettings::default(),
            actors: ActorSettings::default(),
            logging: LoggingSettings::default(),
            services: HashMap::new(),
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_idle_per_endpoint: default_max_idle_per_endpoint(),
            max_idle_age_secs: default_max_idle_age_secs(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing a default file first when
    /// none exists yet.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let content = toml::to_string_pretty(&default_config)
                .context("failed to serialize default config")?;
            tokio::fs::write(path, content)
                .await
                .with_context(|| format!("failed to write default config {}", path.display()))?;
            info!("created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks everything that would otherwise only fail at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.name.is_empty() {
            bail!("node.name must not be empty");
        }
        self.node
            .bind_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| {
                format!("node.bind_address '{}' is not a valid address", self.node.bind_address)
            })?;
        if !(0..=MAX_NODE_ID).contains(&self.node.node_id) {
            bail!("node.node_id must be between 0 and {MAX_NODE_ID}");
        }
        if self.actors.mailbox_capacity == 0 {
            bail!("actors.mailbox_capacity must be greater than zero");
        }
        for (service, endpoints) in &self.services {
            if endpoints.is_empty() {
                bail!("service '{service}' has an empty endpoint list");
            }
            for endpoint in endpoints {
                parse_endpoint(endpoint).with_context(|| {
                    format!("service '{service}' has malformed endpoint '{endpoint}'")
                })?;
            }
        }
        Ok(())
    }

    /// Derives the RPC client tuning from this configuration.
    pub fn client_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            max_idle_per_endpoint: self.rpc.max_idle_per_endpoint,
            dial_timeout: Duration::from_millis(self.rpc.dial_timeout_ms),
            call_timeout: match self.rpc.call_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_idle_age: match self.rpc.max_idle_age_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_frame_len: self.rpc.max_frame_len,
        }
    }

    /// Builds the static resolver backing the `[services]` table, or `None`
    /// when the table is empty.
    pub fn build_resolver(&self) -> anyhow::Result<Option<StaticResolver>> {
        if self.services.is_empty() {
            return Ok(None);
        }
        let mut resolver = StaticResolver::new();
        for (service, endpoints) in &self.services {
            let parsed = endpoints
                .iter()
                .map(|e| parse_endpoint(e))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("service '{service}' has a malformed endpoint"))?;
            resolver = resolver.with_service(service.clone(), parsed);
        }
        Ok(Some(resolver))
    }
}

fn parse_endpoint(value: &str) -> anyhow::Result<Endpoint> {
    let Some((host, port)) = value.rsplit_once(':') else {
        bail!("'{value}' is not of the form host:port");
    };
    if host.is_empty() {
        bail!("'{value}' has an empty host");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("'{value}' has an invalid port"))?;
    Ok(Endpoint::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.node.name, "lattice-node");
        assert!(path.exists());

        // The generated file parses back to the same settings.
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.node.bind_address, config.node.bind_address);
        assert_eq!(reloaded.rpc.call_timeout_ms, config.rpc.call_timeout_ms);
    }

    #[tokio::test]
    async fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        tokio::fs::write(
            &path,
            "[node]\nname = \"roomserver\"\nbind_address = \"127.0.0.1:7301\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.node.name, "roomserver");
        assert_eq!(config.rpc.dial_timeout_ms, 5_000);
        assert_eq!(config.actors.mailbox_capacity, 128);
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = AppConfig::default();
        config.node.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.node.node_id = 5000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config
            .services
            .insert("game".to_string(), vec!["nohost".to_string()]);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn resolver_is_built_from_the_service_table() {
        let mut config = AppConfig::default();
        assert!(config.build_resolver().unwrap().is_none());

        config.services.insert(
            "game".to_string(),
            vec!["10.0.0.1:7300".to_string(), "10.0.0.2:7300".to_string()],
        );
        let resolver = config.build_resolver().unwrap().unwrap();
        let endpoints = lattice_rpc::ServiceResolver::resolve(&resolver, "game")
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn timeouts_of_zero_disable_the_bound() {
        let mut config = AppConfig::default();
        config.rpc.call_timeout_ms = 0;
        config.rpc.max_idle_age_secs = 0;
        let client_config = config.client_config();
        assert!(client_config.call_timeout.is_none());
        assert!(client_config.max_idle_age.is_none());
    }
}
