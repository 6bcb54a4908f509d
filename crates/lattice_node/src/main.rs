//! Main entry point for a Lattice service node.
//!
//! Provides the CLI, configuration loading, and logging setup, then hands
//! control to [`service::ServiceNode`] until a termination signal arrives.

use std::path::PathBuf;

use clap::{Arg, Command};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod id;
mod service;
mod shutdown;

use config::{AppConfig, LoggingSettings};
use service::ServiceNode;

/// Command line arguments.
#[derive(Debug, Clone)]
struct CliArgs {
    config_path: PathBuf,
    name: Option<String>,
    bind_address: Option<String>,
    log_level: Option<String>,
    json_logs: bool,
}

impl CliArgs {
    fn parse() -> Self {
        let matches = Command::new("Lattice Service Node")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Microservice game-backend node speaking the Lattice RPC transport")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("node.toml"),
            )
            .arg(
                Arg::new("name")
                    .short('n')
                    .long("name")
                    .value_name("NAME")
                    .help("Service name this node runs as"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address (e.g. 127.0.0.1:7300)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("node.toml")),
            name: matches.get_one::<String>("name").cloned(),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn setup_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);

    if settings.json_format {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("logging initialized with level: {}", settings.level);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    if let Some(name) = args.name {
        config.node.name = name;
    }
    if let Some(bind_address) = args.bind_address {
        config.node.bind_address = bind_address;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config.validate()?;

    setup_logging(&config.logging)?;

    info!("🚀 starting lattice node '{}'", config.node.name);
    info!(
        "📂 config: {} | bind: {} | services: {}",
        args.config_path.display(),
        config.node.bind_address,
        config.services.len()
    );

    let node = ServiceNode::new(config)?;
    node.run().await
}
