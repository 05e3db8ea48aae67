//! Configuration view and validation commands (`plugin-gateway config`).

use std::path::Path;

use anyhow::{Result, bail};

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use plugin_gateway::config::GatewayToml;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Gateway Configuration");
            println!("=====================");
            println!();

            let mut config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                GatewayToml::load(config_path)?
            } else {
                println!("No config file found at {}", config_path.display());
                println!("Using default configuration.");
                GatewayToml::default()
            };
            println!();

            println!("[server]");
            println!("  host = \"{}\"", config.server.host);
            println!("  port = {}", config.server.port);
            println!("  request_timeout_secs = {}", config.server.request_timeout_secs);
            println!("  cors_permissive = {}", config.server.cors_permissive);
            println!();

            println!("[log]");
            println!("  level = \"{}\"", config.log.level);
            println!("  format = \"{:?}\"", config.log.format);
            if let Some(dir) = &config.log.directory {
                println!("  directory = \"{}\"", dir.display());
            }
            println!();

            println!("[features]");
            println!("  expressions = {}", config.features.expressions);
            if let Some(url) = &config.features.expression_backend_url {
                println!("  expression_backend_url = \"{}\"", url);
            }
            println!();

            println!("[proxy]");
            println!("  identity_header = \"{}\"", config.proxy.identity_header);
            println!("  upstream_timeout_secs = {}", config.proxy.upstream_timeout_secs);
            println!();

            println!("[datasource_cache]");
            println!("  ttl_secs = {}", config.datasource_cache.ttl_secs);
            println!();

            let manifests = config.plugin_manifests()?;
            println!("Plugins: {}", manifests.len());
            for manifest in &manifests {
                println!(
                    "  - {} ({:?}, {} routes)",
                    manifest.id,
                    manifest.plugin_type,
                    manifest.routes.len()
                );
            }
            println!("Datasources: {}", config.datasources.len());
            for ds in &config.datasources {
                println!("  - {} uid={} type={} org={}", ds.name, ds.uid, ds.ds_type, ds.org_id);
            }
            println!();

            config.apply_env_overrides()?;
            println!("Effective values (with env overrides):");
            println!("  listen = {}:{}", config.server.host, config.server.port);
            println!("  log.level = \"{}\"", config.log.level);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let config = GatewayToml::load(config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
                println!();
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
                bail!("{} configuration problem(s) found", warnings.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            GatewayToml::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, request_timeout_secs");
            println!("  - [[plugins.manifests]] or [plugins] directory");
            println!("  - [[datasources]] for the datasource proxy and queries");
            println!();
        }
    }

    Ok(())
}
