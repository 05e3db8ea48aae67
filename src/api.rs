use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use gateway_common::{
    AccessMode, CallerIdentity, DataSourceRef, DatasourceError, GatewayError, PluginRef,
    RequestContext, ResourceCallRequest,
};
use reqwest::Url;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::{AuthGate, AuthRequirements, Caller};
use crate::datasource::DatasourceResolver;
use crate::proxy::{ProxyBuilder, canonical_path, path_after_segments};
use crate::query::{MetricRequest, QueryCoordinator, ResponseEnvelope};
use crate::registry::{PluginRouteRegistry, RouteMatch};
use crate::resource::{BridgeError, ResourceCallBridge, StatusSource};

/// Upper bound on a buffered resource request body.
const MAX_RESOURCE_BODY_BYTES: usize = 32 * 1024 * 1024;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<PluginRouteRegistry>,
    pub coordinator: QueryCoordinator,
    pub bridge: ResourceCallBridge,
    pub proxy: ProxyBuilder,
    pub resolver: DatasourceResolver,
    pub request_timeout: Duration,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Fresh context for one inbound request, bounded by the configured deadline.
    fn request_context(&self) -> RequestContext {
        RequestContext::new().with_timeout(self.request_timeout)
    }
}

// ── Error handling ────────────────────────────────────────────────────

/// Error response: `{"message", "messageId"?, "statusCode", "traceId"}`.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub trace_id: Uuid,
    pub status_source: Option<StatusSource>,
}

impl ApiError {
    pub fn traced(error: impl Into<GatewayError>, trace_id: Uuid) -> Self {
        Self {
            error: error.into(),
            trace_id,
            status_source: None,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self::traced(error, Uuid::new_v4())
    }
}

impl From<DatasourceError> for ApiError {
    fn from(error: DatasourceError) -> Self {
        Self::traced(error, Uuid::new_v4())
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self {
            error: err.error,
            trace_id: Uuid::new_v4(),
            status_source: Some(err.source),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        if status.is_server_error() {
            error!(
                trace_id = %self.trace_id,
                status = status.as_u16(),
                error = ?self.error,
                "request failed"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                status = status.as_u16(),
                error = %self.error,
                "request rejected"
            );
        }

        let mut body = serde_json::json!({
            "message": self.error.to_string(),
            "statusCode": status.as_u16(),
            "traceId": self.trace_id.to_string(),
        });
        if let Some(message_id) = self.error.message_id() {
            body["messageId"] = serde_json::json!(message_id);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(source) = self.status_source {
            response.extensions_mut().insert(source);
        }
        response
    }
}

/// The generic not-found error, shared by the router fallback and unknown plugins.
fn generic_not_found() -> GatewayError {
    GatewayError::NotFound("Not found".into())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/ds/query", post(query_metrics))
        .route("/api/ds/transform", post(transform_metrics))
        .route("/api/plugin-proxy/{plugin_id}", any(plugin_proxy))
        .route("/api/plugin-proxy/{plugin_id}/{*rest}", any(plugin_proxy))
        .route("/api/plugin-api/{*rest}", any(plugin_api_proxy))
        .route("/api/datasources/proxy/uid/{uid}", any(datasource_proxy_by_uid))
        .route(
            "/api/datasources/proxy/uid/{uid}/{*rest}",
            any(datasource_proxy_by_uid),
        )
        .route("/api/datasources/proxy/{id}", any(datasource_proxy_by_id))
        .route("/api/datasources/proxy/{id}/{*rest}", any(datasource_proxy_by_id))
        .route("/api/plugins/{plugin_id}/resources", any(call_resource))
        .route("/api/plugins/{plugin_id}/resources/{*rest}", any(call_resource))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn parse_body(
    body: Result<Json<MetricRequest>, JsonRejection>,
) -> Result<MetricRequest, GatewayError> {
    body.map(|Json(request)| request).map_err(|rejection| {
        GatewayError::BadRequest(format!("bad request data: {}", rejection.body_text()))
    })
}

async fn query_metrics(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    body: Result<Json<MetricRequest>, JsonRejection>,
) -> Result<ResponseEnvelope, ApiError> {
    let ctx = state.request_context();
    let traced = |e: GatewayError| ApiError::traced(e, ctx.request_id);
    let _cancel_on_drop = ctx.cancel.clone().drop_guard();
    AuthGate::authorize(&AuthRequirements::signed_in(), &caller).map_err(traced)?;
    let request = parse_body(body).map_err(traced)?;
    state
        .coordinator
        .query(&ctx, &caller, request)
        .await
        .map_err(traced)
}

async fn transform_metrics(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    body: Result<Json<MetricRequest>, JsonRejection>,
) -> Result<ResponseEnvelope, ApiError> {
    let ctx = state.request_context();
    let traced = |e: GatewayError| ApiError::traced(e, ctx.request_id);
    let _cancel_on_drop = ctx.cancel.clone().drop_guard();
    AuthGate::authorize(&AuthRequirements::signed_in(), &caller).map_err(traced)?;
    let request = parse_body(body).map_err(traced)?;
    state
        .coordinator
        .transform(&ctx, &caller, request)
        .await
        .map_err(traced)
}

async fn plugin_proxy(
    State(state): State<SharedState>,
    Path(params): Path<HashMap<String, String>>,
    Caller(caller): Caller,
    req: Request,
) -> Result<Response, ApiError> {
    let ctx = state.request_context();
    let plugin_id = params.get("plugin_id").cloned().unwrap_or_default();
    proxy_app_route(&state, &ctx, &caller, &plugin_id, req)
        .await
        .map_err(|e| ApiError::traced(e, ctx.request_id))
}

async fn proxy_app_route(
    state: &AppState,
    ctx: &RequestContext,
    caller: &CallerIdentity,
    plugin_id: &str,
    req: Request,
) -> Result<Response, GatewayError> {
    let remainder = canonical_path(&path_after_segments(req.uri().path(), 3))?;

    let entry = match state.registry.match_app_route(plugin_id, req.method(), &remainder) {
        RouteMatch::Matched(entry) => entry,
        RouteMatch::UnknownPlugin => return Err(generic_not_found()),
        RouteMatch::NoRoute => {
            return Err(GatewayError::NotFound(format!(
                "Plugin {} has no route for this path",
                plugin_id
            )));
        }
    };
    AuthGate::authorize(&entry.auth, caller)?;

    let upstream = entry
        .upstream
        .as_ref()
        .ok_or_else(|| GatewayError::internal("Plugin route has no upstream"))?;
    let target = ProxyTarget {
        upstream,
        remainder: &remainder,
        route_relative: entry.relative_to_route(&remainder),
        headers: &entry.headers,
    };
    proxy_to(state, ctx, caller, target, req).await
}

async fn plugin_api_proxy(
    State(state): State<SharedState>,
    Caller(caller): Caller,
    req: Request,
) -> Result<Response, ApiError> {
    let ctx = state.request_context();
    proxy_api_route(&state, &ctx, &caller, req)
        .await
        .map_err(|e| ApiError::traced(e, ctx.request_id))
}

async fn proxy_api_route(
    state: &AppState,
    ctx: &RequestContext,
    caller: &CallerIdentity,
    req: Request,
) -> Result<Response, GatewayError> {
    let remainder = canonical_path(&path_after_segments(req.uri().path(), 2))?;
    let entry = state
        .registry
        .match_api_route(req.method(), &remainder)
        .ok_or_else(generic_not_found)?;
    AuthGate::authorize(&entry.auth, caller)?;

    let upstream = entry
        .upstream
        .as_ref()
        .ok_or_else(|| GatewayError::internal("Plugin route has no upstream"))?;
    let target = ProxyTarget {
        upstream,
        remainder: &remainder,
        route_relative: entry.relative_to_route(&remainder),
        headers: &entry.headers,
    };
    proxy_to(state, ctx, caller, target, req).await
}

async fn datasource_proxy_by_uid(
    State(state): State<SharedState>,
    Path(params): Path<HashMap<String, String>>,
    Caller(caller): Caller,
    req: Request,
) -> Result<Response, ApiError> {
    let ctx = state.request_context();
    let uid = params.get("uid").cloned().unwrap_or_default();
    datasource_proxy(&state, &ctx, &caller, DataSourceRef::by_uid(uid), 5, req)
        .await
        .map_err(|e| ApiError::traced(e, ctx.request_id))
}

async fn datasource_proxy_by_id(
    State(state): State<SharedState>,
    Path(params): Path<HashMap<String, String>>,
    Caller(caller): Caller,
    req: Request,
) -> Result<Response, ApiError> {
    let ctx = state.request_context();
    let id: i64 = params
        .get("id")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            ApiError::traced(GatewayError::BadRequest("id is invalid".into()), ctx.request_id)
        })?;
    datasource_proxy(&state, &ctx, &caller, DataSourceRef::by_id(id), 4, req)
        .await
        .map_err(|e| ApiError::traced(e, ctx.request_id))
}

/// Datasource proxy: `skip` is the number of path segments before the remainder.
async fn datasource_proxy(
    state: &AppState,
    ctx: &RequestContext,
    caller: &CallerIdentity,
    reference: DataSourceRef,
    skip: usize,
    req: Request,
) -> Result<Response, GatewayError> {
    AuthGate::authorize(&AuthRequirements::signed_in(), caller)?;
    let remainder = canonical_path(&path_after_segments(req.uri().path(), skip))?;
    let datasource = state.resolver.resolve_datasource(&reference, caller).await?;
    if datasource.access == AccessMode::Direct {
        return Err(GatewayError::BadRequest(
            "Data source is configured for direct access and cannot be proxied".into(),
        ));
    }

    let datasource_url = Url::parse(&datasource.url)
        .map_err(|e| GatewayError::internal_with("Invalid data source url", e))?;

    let entry = state
        .registry
        .match_datasource_route(&datasource.ds_type, req.method(), &remainder);
    let target = match &entry {
        Some(entry) => {
            AuthGate::authorize(&entry.auth, caller)?;
            match &entry.upstream {
                Some(upstream) => ProxyTarget {
                    upstream,
                    remainder: &remainder,
                    route_relative: entry.relative_to_route(&remainder),
                    headers: &entry.headers,
                },
                None => ProxyTarget {
                    upstream: &datasource_url,
                    remainder: &remainder,
                    route_relative: &remainder,
                    headers: &entry.headers,
                },
            }
        }
        None => ProxyTarget {
            upstream: &datasource_url,
            remainder: &remainder,
            route_relative: &remainder,
            headers: &[],
        },
    };
    proxy_to(state, ctx, caller, target, req).await
}

/// Where a proxied request is sent.
struct ProxyTarget<'a> {
    upstream: &'a Url,
    /// Canonical path after the endpoint prefix.
    remainder: &'a str,
    /// The part of `remainder` joined onto `upstream`.
    route_relative: &'a str,
    headers: &'a [(HeaderName, HeaderValue)],
}

/// Shared tail of every proxy route: build the outbound request and relay the response.
async fn proxy_to(
    state: &AppState,
    ctx: &RequestContext,
    caller: &CallerIdentity,
    target: ProxyTarget<'_>,
    req: Request,
) -> Result<Response, GatewayError> {
    let query = req.uri().query().map(str::to_owned);
    let proxy_ctx = state.proxy.context(
        caller,
        target.upstream,
        target.remainder,
        target.route_relative,
        query.as_deref(),
    )?;
    let outbound = state.proxy.build_request(&proxy_ctx, req, target.headers)?;
    state.proxy.forward(ctx, outbound).await
}

async fn call_resource(
    State(state): State<SharedState>,
    Path(params): Path<HashMap<String, String>>,
    Caller(caller): Caller,
    req: Request,
) -> Result<Response, ApiError> {
    let ctx = state.request_context();
    let trace_id = ctx.request_id;
    let traced = |e: GatewayError| ApiError::traced(e, trace_id);

    let plugin_id = params.get("plugin_id").cloned().unwrap_or_default();
    if !state.registry.is_installed(&plugin_id) {
        return Err(traced(generic_not_found()));
    }
    AuthGate::authorize(&AuthRequirements::signed_in(), &caller).map_err(traced)?;

    let (parts, body) = req.into_parts();
    let sub_path = canonical_path(&path_after_segments(parts.uri.path(), 4)).map_err(traced)?;
    let body = axum::body::to_bytes(body, MAX_RESOURCE_BODY_BYTES)
        .await
        .map_err(|e| {
            traced(GatewayError::BadRequest(format!("Failed to read request body: {}", e)))
        })?;

    let request = ResourceCallRequest {
        plugin: PluginRef {
            plugin_id,
            org_id: caller.org_id,
        },
        sub_path,
        query: parts.uri.query().map(str::to_owned),
        caller,
        method: parts.method,
        headers: parts.headers,
        body,
    };

    state.bridge.call(ctx, request).await.map_err(|e| ApiError {
        trace_id,
        ..ApiError::from(e)
    })
}

/// Router fallback.
pub async fn fallback() -> ApiError {
    ApiError::from(generic_not_found())
}
