use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use herdbook::config::{RegistryConfig, CONFIG_FILENAME};
use herdbook::server;

#[derive(Parser)]
#[command(name = "herdbook")]
#[command(about = "Lease-based service registry with peer replication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a registry node
    Serve(ServeArgs),
    /// Validate configuration and print the effective settings
    CheckConfig(CheckConfigArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Path to the TOML config file (defaults when absent)
    #[arg(long, env = "HERDBOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured node name
    #[arg(long, env = "HERDBOOK_NODE_NAME")]
    node_name: Option<String>,

    /// Override the configured listen port
    #[arg(long, env = "HERDBOOK_PORT")]
    port: Option<u16>,

    /// Override the configured peer list (comma-separated base URLs)
    #[arg(long, env = "HERDBOOK_PEERS", value_delimiter = ',')]
    peers: Option<Vec<String>>,
}

#[derive(clap::Args)]
struct CheckConfigArgs {
    /// Path to the TOML config file
    #[arg(long, env = "HERDBOOK_CONFIG")]
    config: Option<PathBuf>,
}

/// Explicit path wins; otherwise a `herdbook.toml` in the working directory;
/// otherwise built-in defaults.
fn resolve_config(path: Option<&Path>) -> anyhow::Result<RegistryConfig> {
    match path {
        Some(path) => RegistryConfig::load_or_default(Some(path)),
        None if Path::new(CONFIG_FILENAME).exists() => {
            RegistryConfig::load_or_default(Some(Path::new(CONFIG_FILENAME)))
        }
        None => RegistryConfig::load_or_default(None),
    }
}

fn load_with_overrides(args: &ServeArgs) -> anyhow::Result<RegistryConfig> {
    let mut config = resolve_config(args.config.as_deref())?;
    if let Some(node_name) = &args.node_name {
        config.node_name = node_name.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(peers) = &args.peers {
        config.peers = peers.clone();
    }
    config
        .validate()
        .context("Configuration invalid after CLI overrides")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            server::init_tracing();
            let config = load_with_overrides(&args)?;
            server::serve(config).await?;
        }
        Commands::CheckConfig(args) => {
            let config = resolve_config(args.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
