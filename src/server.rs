use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{self, AppState, SharedState};
use crate::config::GatewayToml;
use crate::datasource::{CachingDatasourceCache, DatasourceResolver, StaticDatasourceStore};
use crate::plugin::PluginClients;
use crate::proxy::{ProxyBuilder, ReqwestTransport};
use crate::query::QueryCoordinator;
use crate::registry::PluginRouteRegistry;
use crate::resource::ResourceCallBridge;

/// Build the full application router: API routes, JSON not-found fallback, request tracing.
pub fn build_router(state: SharedState, cors_permissive: bool) -> Router {
    let mut app = api::api_router()
        .fallback(api::fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire every component from configuration. Fails on invalid manifests or URLs.
pub fn build_state(config: &GatewayToml) -> Result<AppState> {
    let manifests = config.plugin_manifests()?;
    let registry = PluginRouteRegistry::from_manifests(&manifests)
        .context("Failed to build plugin route registry")?;

    let expression_backend = config
        .features
        .expressions
        .then_some(config.features.expression_backend_url.as_deref())
        .flatten();
    let plugins = Arc::new(PluginClients::from_manifests(
        &manifests,
        expression_backend,
        &config.proxy.identity_header,
        config.upstream_timeout(),
    )?);

    let store = StaticDatasourceStore::new(config.resolved_datasources());
    let cache = CachingDatasourceCache::new(Arc::new(store), config.cache_ttl());
    let resolver = DatasourceResolver::new(Arc::new(cache));

    let transport = ReqwestTransport::new(config.upstream_timeout())?;
    let proxy = ProxyBuilder::new(&config.proxy.identity_header, Arc::new(transport))?;

    info!(
        plugins = registry.len(),
        backends = plugins.len(),
        datasources = config.datasources.len(),
        expressions = config.features.expressions,
        "gateway state initialized"
    );

    Ok(AppState {
        registry: Arc::new(registry),
        coordinator: QueryCoordinator::new(
            resolver.clone(),
            plugins.clone(),
            config.features.expressions,
        ),
        bridge: ResourceCallBridge::new(plugins),
        proxy,
        resolver,
        request_timeout: config.request_timeout(),
    })
}

/// Start the gateway and serve until Ctrl+C.
pub async fn start_server(config: GatewayToml) -> Result<()> {
    let state = Arc::new(build_state(&config)?);
    let app = build_router(state, config.server.cors_permissive);

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("Plugin gateway listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        return;
    }
    info!("Shutting down...");
}
