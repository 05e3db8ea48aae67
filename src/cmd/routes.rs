//! Route listing command (`plugin-gateway routes`).

use std::path::Path;

use anyhow::Result;

use plugin_gateway::config::GatewayToml;
use plugin_gateway::registry::PluginRouteRegistry;

pub fn cmd_routes(config_path: &Path) -> Result<()> {
    let mut config = GatewayToml::load_or_default(config_path)?;
    config.apply_env_overrides()?;
    let registry = PluginRouteRegistry::from_manifests(&config.plugin_manifests()?)?;

    let entries = registry.entries();
    if entries.is_empty() {
        println!("No plugin routes configured.");
        return Ok(());
    }

    println!(
        "{:<10} {:<20} {:<7} {:<50} {:<30} AUTH",
        "KIND", "PLUGIN", "METHOD", "PATH", "UPSTREAM"
    );
    for entry in entries {
        let method = entry
            .method
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "*".to_string());
        let upstream = entry
            .upstream
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "(datasource url)".to_string());
        println!(
            "{:<10} {:<20} {:<7} {:<50} {:<30} {}",
            entry.kind.label(),
            entry.plugin_id,
            method,
            entry.mount_path(),
            upstream,
            entry.auth.describe()
        );
    }
    Ok(())
}
