//! Gateway server command (`plugin-gateway serve`).

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use plugin_gateway::config::GatewayToml;
use plugin_gateway::{server, telemetry};

pub async fn cmd_serve(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = GatewayToml::load_or_default(config_path)?;
    config.apply_env_overrides()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    // Keep the guard alive for the life of the server so file logs get flushed.
    let _log_guard = telemetry::init(&config.log)?;

    if !config_path.exists() {
        warn!(path = %config_path.display(), "config file not found, using defaults");
    }
    for warning in config.validate() {
        warn!("config: {}", warning);
    }

    server::start_server(config).await
}
