//! Plugin route registry.
//!
//! Built once at startup from plugin manifests and shared read-only by every
//! request afterwards. There is no process-wide instance: the server owns one
//! `Arc<PluginRouteRegistry>` and tests build their own.
//!
//! | Plugin type  | Mount                                    | Route kind             |
//! |--------------|------------------------------------------|------------------------|
//! | `app`        | `/api/plugin-proxy/{pluginId}/{path}`    | `AppPluginRoute`       |
//! | `api`        | `/api/plugin-api/{path}`                 | `ApiPluginRoute`       |
//! | `datasource` | `/api/datasources/proxy/{ds}/{path}`     | `DatasourceProxyRoute` |

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use axum::http::{HeaderName, HeaderValue, Method};
use gateway_common::OrgRole;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::AuthRequirements;

/// Kind of plugin declared in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    App,
    Api,
    Datasource,
}

/// A static header a route adds to outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHeader {
    pub name: String,
    pub content: String,
}

/// A route as declared in `plugin.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteManifest {
    #[serde(default)]
    pub path: String,
    /// Empty means any method.
    #[serde(default)]
    pub method: String,
    /// Upstream base URL. May be empty for datasource routes (the datasource URL is used).
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_true")]
    pub req_signed_in: bool,
    #[serde(default)]
    pub req_role: Option<OrgRole>,
    #[serde(default)]
    pub req_server_admin: bool,
    #[serde(default)]
    pub headers: Vec<RouteHeader>,
}

fn default_true() -> bool {
    true
}

/// A plugin manifest (`plugin.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteManifest>,
    /// Base URL of the plugin's backend process, for query and resource calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plugin manifest: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plugin manifest: {}", path.display()))
    }

    /// Load every `*/plugin.json` directly below `dir`.
    pub fn discover(dir: &Path) -> Result<Vec<Self>> {
        let pattern = dir.join("*").join("plugin.json");
        let pattern = pattern.to_string_lossy();
        let mut manifests = Vec::new();
        for entry in glob::glob(&pattern).context("Invalid plugin directory pattern")? {
            let path = entry.context("Failed to read plugin directory entry")?;
            debug!(path = %path.display(), "loading plugin manifest");
            manifests.push(Self::load(&path)?);
        }
        Ok(manifests)
    }
}

/// The closed set of route kinds the gate and proxy handle uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteKind {
    ApiPluginRoute,
    AppPluginRoute,
    DatasourceProxyRoute,
}

impl RouteKind {
    fn for_plugin(plugin_type: PluginType) -> Self {
        match plugin_type {
            PluginType::App => RouteKind::AppPluginRoute,
            PluginType::Api => RouteKind::ApiPluginRoute,
            PluginType::Datasource => RouteKind::DatasourceProxyRoute,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RouteKind::ApiPluginRoute => "api",
            RouteKind::AppPluginRoute => "app",
            RouteKind::DatasourceProxyRoute => "datasource",
        }
    }
}

/// One registered route. Read-only after startup.
#[derive(Debug, Clone)]
pub struct PluginRouteEntry {
    pub plugin_id: String,
    pub kind: RouteKind,
    /// `None` matches any method.
    pub method: Option<Method>,
    /// Normalized: no leading or trailing slash; empty matches everything.
    pub path_suffix: String,
    pub auth: AuthRequirements,
    /// `None` only for datasource routes that reuse the datasource URL.
    pub upstream: Option<Url>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl PluginRouteEntry {
    fn from_manifest(plugin_id: &str, kind: RouteKind, route: &RouteManifest) -> Result<Self> {
        let method = match route.method.trim() {
            "" | "*" => None,
            m => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).with_context(|| {
                    format!("Plugin {}: invalid route method '{}'", plugin_id, m)
                })?,
            ),
        };

        let upstream = match route.url.trim() {
            "" if kind == RouteKind::DatasourceProxyRoute => None,
            "" => bail!(
                "Plugin {}: route '{}' has no upstream url",
                plugin_id,
                route.path
            ),
            raw => Some(
                Url::parse(raw)
                    .with_context(|| format!("Plugin {}: invalid route url '{}'", plugin_id, raw))?,
            ),
        };

        let headers = route
            .headers
            .iter()
            .map(|h| {
                let name = HeaderName::from_bytes(h.name.as_bytes()).with_context(|| {
                    format!("Plugin {}: invalid header name '{}'", plugin_id, h.name)
                })?;
                let value = HeaderValue::from_str(&h.content).with_context(|| {
                    format!("Plugin {}: invalid value for header '{}'", plugin_id, h.name)
                })?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            plugin_id: plugin_id.to_string(),
            kind,
            method,
            path_suffix: normalize_path(&route.path),
            auth: AuthRequirements {
                signed_in: route.req_signed_in,
                min_role: route.req_role,
                server_admin: route.req_server_admin,
            },
            upstream,
            headers,
        })
    }

    /// Method matches and `path_suffix` is a segment-wise prefix of `remainder`.
    pub fn matches(&self, method: &Method, remainder: &str) -> bool {
        if self.method.as_ref().is_some_and(|m| m != method) {
            return false;
        }
        strip_segment_prefix(remainder, &self.path_suffix).is_some()
    }

    /// The part of `remainder` after this route's path.
    pub fn relative_to_route<'a>(&self, remainder: &'a str) -> &'a str {
        strip_segment_prefix(remainder, &self.path_suffix).unwrap_or(remainder)
    }

    /// Public path this route is reachable under.
    pub fn mount_path(&self) -> String {
        let base = match self.kind {
            RouteKind::AppPluginRoute => format!("/api/plugin-proxy/{}", self.plugin_id),
            RouteKind::ApiPluginRoute => "/api/plugin-api".to_string(),
            RouteKind::DatasourceProxyRoute => "/api/datasources/proxy/{datasource}".to_string(),
        };
        if self.path_suffix.is_empty() {
            format!("{}/*", base)
        } else {
            format!("{}/{}", base, self.path_suffix)
        }
    }
}

/// Outcome of looking up an app-plugin route.
#[derive(Debug, Clone)]
pub enum RouteMatch {
    /// The plugin is not installed; callers fall through to the generic not-found handler.
    UnknownPlugin,
    /// The plugin exists but declares no route for this method and path.
    NoRoute,
    Matched(Arc<PluginRouteEntry>),
}

#[derive(Debug, Clone)]
struct RegisteredPlugin {
    plugin_type: PluginType,
    routes: Vec<Arc<PluginRouteEntry>>,
}

/// Per-plugin routing table.
#[derive(Debug, Clone, Default)]
pub struct PluginRouteRegistry {
    plugins: HashMap<String, RegisteredPlugin>,
}

impl PluginRouteRegistry {
    pub fn from_manifests<'a>(
        manifests: impl IntoIterator<Item = &'a PluginManifest>,
    ) -> Result<Self> {
        let mut plugins = HashMap::new();
        for manifest in manifests {
            if manifest.id.trim().is_empty() {
                bail!("Plugin manifest with empty id");
            }
            if plugins.contains_key(&manifest.id) {
                bail!("Plugin {} is declared more than once", manifest.id);
            }
            let kind = RouteKind::for_plugin(manifest.plugin_type);
            let routes = manifest
                .routes
                .iter()
                .map(|route| {
                    PluginRouteEntry::from_manifest(&manifest.id, kind, route).map(Arc::new)
                })
                .collect::<Result<Vec<_>>>()?;
            if routes.is_empty() && manifest.plugin_type != PluginType::Datasource {
                warn!(plugin = %manifest.id, "plugin declares no proxy routes");
            }
            plugins.insert(
                manifest.id.clone(),
                RegisteredPlugin {
                    plugin_type: manifest.plugin_type,
                    routes,
                },
            );
        }
        Ok(Self { plugins })
    }

    pub fn is_installed(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    pub fn plugin_type(&self, plugin_id: &str) -> Option<PluginType> {
        self.plugins.get(plugin_id).map(|p| p.plugin_type)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Route lookup for `/api/plugin-proxy/{pluginId}/...`.
    pub fn match_app_route(
        &self,
        plugin_id: &str,
        method: &Method,
        remainder: &str,
    ) -> RouteMatch {
        match self.plugins.get(plugin_id) {
            Some(plugin) if plugin.plugin_type == PluginType::App => {
                match best_match(plugin.routes.iter(), method, remainder) {
                    Some(entry) => RouteMatch::Matched(entry),
                    None => RouteMatch::NoRoute,
                }
            }
            _ => RouteMatch::UnknownPlugin,
        }
    }

    /// Route lookup across every API plugin for `/api/plugin-api/...`.
    pub fn match_api_route(
        &self,
        method: &Method,
        remainder: &str,
    ) -> Option<Arc<PluginRouteEntry>> {
        let routes = self
            .plugins
            .values()
            .filter(|p| p.plugin_type == PluginType::Api)
            .flat_map(|p| p.routes.iter());
        best_match(routes, method, remainder)
    }

    /// Route lookup in the manifest of a datasource's plugin type.
    pub fn match_datasource_route(
        &self,
        ds_type: &str,
        method: &Method,
        remainder: &str,
    ) -> Option<Arc<PluginRouteEntry>> {
        let plugin = self.plugins.get(ds_type)?;
        if plugin.plugin_type != PluginType::Datasource {
            return None;
        }
        best_match(plugin.routes.iter(), method, remainder)
    }

    /// Every route, ordered by kind, plugin and path.
    pub fn entries(&self) -> Vec<Arc<PluginRouteEntry>> {
        let mut entries: Vec<_> = self
            .plugins
            .values()
            .flat_map(|p| p.routes.iter().cloned())
            .collect();
        entries.sort_by(|a, b| {
            (a.kind, &a.plugin_id, &a.path_suffix).cmp(&(b.kind, &b.plugin_id, &b.path_suffix))
        });
        entries
    }
}

/// Longest matching path wins; ties keep declaration order.
fn best_match<'a>(
    routes: impl Iterator<Item = &'a Arc<PluginRouteEntry>>,
    method: &Method,
    remainder: &str,
) -> Option<Arc<PluginRouteEntry>> {
    let mut best: Option<&Arc<PluginRouteEntry>> = None;
    for route in routes.filter(|r| r.matches(method, remainder)) {
        if best.is_none_or(|b| route.path_suffix.len() > b.path_suffix.len()) {
            best = Some(route);
        }
    }
    best.cloned()
}

pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}
