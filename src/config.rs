//! Gateway configuration, read from `gateway.toml`.
//!
//! Every section is optional; a missing file or an empty file yields a
//! gateway bound to `127.0.0.1:3000` with no plugins and no datasources.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//! request_timeout_secs = 30
//! cors_permissive = false
//!
//! [log]
//! level = "info"
//! format = "json"
//! directory = "/var/log/plugin-gateway"
//!
//! [features]
//! expressions = true
//! expression_backend_url = "http://127.0.0.1:9100"
//!
//! [proxy]
//! identity_header = "X-Caller-Context"
//! upstream_timeout_secs = 30
//!
//! [plugins]
//! directory = "plugins"
//!
//! [[plugins.manifests]]
//! id = "example-app"
//! type = "app"
//!
//! [[plugins.manifests.routes]]
//! path = "api"
//! url = "http://127.0.0.1:8081"
//! reqRole = "Editor"
//!
//! [datasource_cache]
//! ttl_secs = 60
//!
//! [[datasources]]
//! id = 1
//! uid = "prom-main"
//! name = "Prometheus"
//! type = "prometheus"
//! url = "http://127.0.0.1:9090"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gateway_common::{AccessMode, OrgRole, ResolvedDataSource};
use serde::{Deserialize, Serialize};

use crate::proxy::DEFAULT_IDENTITY_HEADER;
use crate::registry::{PluginManifest, PluginType};

pub const DEFAULT_CONFIG_FILE: &str = "gateway.toml";

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deadline for every backend call made on behalf of one request.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Allow any origin. Intended for local development only.
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_timeout_secs(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings. `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs also go to a daily-rotated file in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// Feature flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesSection {
    /// Enables `POST /api/ds/transform`.
    #[serde(default)]
    pub expressions: bool,
    /// Backend that evaluates expression batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression_backend_url: Option<String>,
}

/// Reverse-proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// Header carrying the serialized caller identity to backends.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
    #[serde(default = "default_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            identity_header: default_identity_header(),
            upstream_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Installed plugins: discovered from a directory and/or declared inline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<PluginManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceCacheSection {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl Default for DatasourceCacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// A statically configured datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceEntry {
    pub id: i64,
    pub uid: String,
    pub name: String,
    /// Plugin id serving this datasource.
    #[serde(rename = "type")]
    pub ds_type: String,
    pub url: String,
    #[serde(default)]
    pub access: AccessMode,
    #[serde(default = "default_org_id")]
    pub org_id: i64,
    #[serde(default)]
    pub min_role: OrgRole,
}

fn default_org_id() -> i64 {
    1
}

impl From<&DatasourceEntry> for ResolvedDataSource {
    fn from(entry: &DatasourceEntry) -> Self {
        ResolvedDataSource {
            id: entry.id,
            uid: entry.uid.clone(),
            name: entry.name.clone(),
            ds_type: entry.ds_type.clone(),
            url: entry.url.clone(),
            access: entry.access,
            org_id: entry.org_id,
            min_role: entry.min_role,
        }
    }
}

/// Top-level structure of `gateway.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub features: FeaturesSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub plugins: PluginsSection,
    #[serde(default)]
    pub datasource_cache: DatasourceCacheSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasources: Vec<DatasourceEntry>,
}

impl GatewayToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gateway.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize gateway.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `GATEWAY_HOST`, `GATEWAY_PORT` and `GATEWAY_LOG_LEVEL` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("GATEWAY_HOST").filter(|v| !v.is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = var("GATEWAY_PORT").filter(|v| !v.is_empty()) {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid GATEWAY_PORT '{}'", port))?;
        }
        if let Some(level) = var("GATEWAY_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse()
            .with_context(|| format!("Invalid listen address '{}'", addr))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.upstream_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.datasource_cache.ttl_secs)
    }

    /// Inline manifests followed by those discovered in `plugins.directory`.
    pub fn plugin_manifests(&self) -> Result<Vec<PluginManifest>> {
        let mut manifests = self.plugins.manifests.clone();
        if let Some(dir) = &self.plugins.directory {
            manifests.extend(PluginManifest::discover(dir)?);
        }
        Ok(manifests)
    }

    pub fn resolved_datasources(&self) -> Vec<ResolvedDataSource> {
        self.datasources.iter().map(ResolvedDataSource::from).collect()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.socket_addr().is_err() {
            warnings.push(format!(
                "Invalid listen address '{}:{}'",
                self.server.host, self.server.port
            ));
        }

        if self.server.request_timeout_secs == 0 {
            warnings.push(
                "server.request_timeout_secs is 0: every backend call will time out".into(),
            );
        }

        if tracing_subscriber::EnvFilter::try_new(&self.log.level).is_err() {
            warnings.push(format!("Invalid log level '{}'", self.log.level));
        }

        if self.features.expressions && self.features.expression_backend_url.is_none() {
            warnings.push(
                concat!(
                    "features.expressions is enabled but no expression_backend_url is set: ",
                    "/api/ds/transform will return 404"
                )
                .into(),
            );
        }

        if axum::http::HeaderName::from_bytes(self.proxy.identity_header.as_bytes()).is_err() {
            warnings.push(format!(
                "Invalid proxy.identity_header '{}'",
                self.proxy.identity_header
            ));
        }

        for manifest in &self.plugins.manifests {
            if manifest.plugin_type == PluginType::Datasource {
                continue;
            }
            for route in manifest.routes.iter().filter(|r| r.url.trim().is_empty()) {
                warnings.push(format!(
                    "Plugin {}: route '{}' has no url",
                    manifest.id, route.path
                ));
            }
        }

        let mut uids = HashSet::new();
        let mut ids = HashSet::new();
        for ds in &self.datasources {
            if !uids.insert((ds.org_id, ds.uid.as_str())) {
                warnings.push(format!("Duplicate datasource uid '{}'", ds.uid));
            }
            if !ids.insert((ds.org_id, ds.id)) {
                warnings.push(format!("Duplicate datasource id {}", ds.id));
            }
            if ds.access == AccessMode::Proxy && reqwest::Url::parse(&ds.url).is_err() {
                warnings.push(format!("Datasource '{}' has an invalid url '{}'", ds.uid, ds.url));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    // =========================================
    // Parsing tests
    // =========================================

    #[test]
    fn test_gateway_toml_parse_empty() {
        let config = GatewayToml::parse("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Text);
        assert!(!config.features.expressions);
        assert_eq!(config.proxy.identity_header, "X-Caller-Context");
        assert_eq!(config.datasource_cache.ttl_secs, 60);
        assert!(config.datasources.is_empty());
    }

    #[test]
    fn test_gateway_toml_parse_full() {
        let content = r#"
[server]
host = "0.0.0.0"
port = 8080

[log]
level = "debug"
format = "json"

[features]
expressions = true
expression_backend_url = "http://127.0.0.1:9100"

[[plugins.manifests]]
id = "example-app"
type = "app"

[[plugins.manifests.routes]]
path = "api"
url = "http://127.0.0.1:8081"
reqRole = "Editor"

[[datasources]]
id = 1
uid = "prom-main"
name = "Prometheus"
type = "prometheus"
url = "http://127.0.0.1:9090"
min_role = "Editor"
"#;
        let config = GatewayToml::parse(content).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(config.features.expressions);
        assert_eq!(config.plugins.manifests.len(), 1);
        assert_eq!(config.plugins.manifests[0].routes[0].req_role, Some(OrgRole::Editor));

        let ds = &config.resolved_datasources()[0];
        assert_eq!(ds.uid, "prom-main");
        assert_eq!(ds.ds_type, "prometheus");
        assert_eq!(ds.org_id, 1);
        assert_eq!(ds.access, AccessMode::Proxy);
        assert_eq!(ds.min_role, OrgRole::Editor);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_gateway_toml_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.toml");

        let mut config = GatewayToml::default();
        config.server.port = 4000;
        config.datasources.push(DatasourceEntry {
            id: 7,
            uid: "loki".into(),
            name: "Loki".into(),
            ds_type: "loki".into(),
            url: "http://127.0.0.1:3100".into(),
            access: AccessMode::Proxy,
            org_id: 1,
            min_role: OrgRole::Viewer,
        });
        config.save(&path).unwrap();

        let loaded = GatewayToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4000);
        assert_eq!(loaded.datasources, config.datasources);
    }

    #[test]
    fn test_gateway_toml_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = GatewayToml::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_gateway_toml_parse_error_has_context() {
        let err = GatewayToml::parse("[server]\nport = \"not a number\"").unwrap_err();
        assert!(err.to_string().contains("gateway.toml"));
    }

    // =========================================
    // Override tests
    // =========================================

    #[test]
    fn test_env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("GATEWAY_HOST", "0.0.0.0"),
            ("GATEWAY_PORT", "9999"),
            ("GATEWAY_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayToml::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_env_override_invalid_port() {
        let mut config = GatewayToml::default();
        let result =
            config.apply_overrides_from(|k| (k == "GATEWAY_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    // =========================================
    // Validation tests
    // =========================================

    #[test]
    fn test_validate_expressions_without_backend() {
        let config = GatewayToml::parse("[features]\nexpressions = true").unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("expression_backend_url"));
    }

    #[test]
    fn test_validate_duplicate_datasources() {
        let content = r#"
[[datasources]]
id = 1
uid = "a"
name = "A"
type = "prometheus"
url = "http://a"

[[datasources]]
id = 1
uid = "a"
name = "B"
type = "prometheus"
url = "http://b"
"#;
        let warnings = GatewayToml::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("uid 'a'")));
        assert!(warnings.iter().any(|w| w.contains("id 1")));
    }

    #[test]
    fn test_validate_app_route_without_url() {
        let content = r#"
[[plugins.manifests]]
id = "broken-app"
type = "app"

[[plugins.manifests.routes]]
path = "api"
"#;
        let warnings = GatewayToml::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("broken-app")));
    }

    #[test]
    fn test_plugin_manifests_include_discovered() {
        let dir = tempdir().unwrap();
        let plugin_dir = dir.path().join("my-api");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin.json"),
            r#"{"id":"my-api","type":"api","routes":[{"path":"v1","url":"http://127.0.0.1:1"}]}"#,
        )
        .unwrap();

        let mut config = GatewayToml::default();
        config.plugins.directory = Some(dir.path().to_path_buf());
        let manifests = config.plugin_manifests().unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].plugin_type, PluginType::Api);
    }
}
