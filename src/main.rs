use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use plugin_gateway::config::DEFAULT_CONFIG_FILE;

mod cmd;

#[derive(Parser)]
#[command(name = "plugin-gateway")]
#[command(version, about = "Request gateway for plugin backends and data sources")]
pub struct Cli {
    /// Path to the gateway configuration file
    #[arg(short, long, global = true, env = "GATEWAY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway server
    Serve {
        /// Override `server.host`
        #[arg(long)]
        host: Option<String>,
        /// Override `server.port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List the plugin routes the gateway mounts
    Routes,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default gateway.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(&cli.config, host.clone(), *port).await?,
        Commands::Routes => cmd::cmd_routes(&cli.config)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
