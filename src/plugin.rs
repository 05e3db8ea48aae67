//! Plugin backend clients.
//!
//! [`PluginClients`] maps plugin ids to their [`PluginClient`] and holds the
//! optional transform (expression) backend. [`HttpPluginClient`] reaches a
//! plugin backend that serves the query and resource protocol over HTTP:
//!
//! | Call            | Request                                   |
//! |-----------------|-------------------------------------------|
//! | `query_data`    | `POST {backend}/query` with the batch JSON |
//! | `call_resource` | `{method} {backend}/resources/{sub_path}`  |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::http::{HeaderName, StatusCode, header};
use futures_util::StreamExt;
use gateway_common::{
    BackendRequest, PluginClient, PluginError, QueryDataResponse, RequestContext,
    ResourceCallRequest, ResourcePart, ResourceResponseSender,
};
use reqwest::Url;
use tracing::debug;

use crate::proxy::{join_url, serialize_identity};
use crate::registry::PluginManifest;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Plugin id to backend client.
#[derive(Clone, Default)]
pub struct PluginClients {
    clients: HashMap<String, Arc<dyn PluginClient>>,
    transform: Option<Arc<dyn PluginClient>>,
}

impl PluginClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(
        mut self,
        plugin_id: impl Into<String>,
        client: Arc<dyn PluginClient>,
    ) -> Self {
        self.clients.insert(plugin_id.into(), client);
        self
    }

    pub fn with_transform(mut self, client: Arc<dyn PluginClient>) -> Self {
        self.transform = Some(client);
        self
    }

    /// One HTTP client per manifest that declares a `backendUrl`.
    pub fn from_manifests(
        manifests: &[PluginManifest],
        expression_backend_url: Option<&str>,
        identity_header: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut clients = Self::new();
        for manifest in manifests {
            if let Some(url) = &manifest.backend_url {
                let client = HttpPluginClient::new(url, identity_header, timeout)
                    .with_context(|| format!("Plugin {}: invalid backend", manifest.id))?;
                clients = clients.with_client(manifest.id.clone(), Arc::new(client));
            }
        }
        if let Some(url) = expression_backend_url {
            let client = HttpPluginClient::new(url, identity_header, timeout)
                .context("Invalid expression backend")?;
            clients = clients.with_transform(Arc::new(client));
        }
        Ok(clients)
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<dyn PluginClient>> {
        self.clients.get(plugin_id).cloned()
    }

    pub fn transform(&self) -> Option<Arc<dyn PluginClient>> {
        self.transform.clone()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// A plugin backend reached over HTTP.
pub struct HttpPluginClient {
    base: Url,
    identity_header: HeaderName,
    client: reqwest::Client,
}

impl HttpPluginClient {
    pub fn new(base_url: &str, identity_header: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid backend url '{}'", base_url))?;
        let identity_header = HeaderName::from_bytes(identity_header.as_bytes())
            .with_context(|| format!("Invalid identity header name '{}'", identity_header))?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("Failed to build plugin HTTP client")?;
        Ok(Self {
            base,
            identity_header,
            client,
        })
    }

    fn url(&self, path: &str, query: Option<&str>) -> Result<Url, PluginError> {
        join_url(&self.base, path, query).map_err(|e| PluginError::Failed(e.into()))
    }
}

fn request_error(err: reqwest::Error) -> PluginError {
    if err.is_connect() || err.is_timeout() {
        PluginError::Unavailable(err.to_string())
    } else {
        PluginError::Failed(err.into())
    }
}

#[async_trait]
impl PluginClient for HttpPluginClient {
    async fn query_data(
        &self,
        ctx: &RequestContext,
        request: BackendRequest,
    ) -> Result<QueryDataResponse, PluginError> {
        let identity =
            serialize_identity(&request.caller).map_err(|e| PluginError::Failed(e.into()))?;
        let url = self.url("query", None)?;
        debug!(
            request_id = %ctx.request_id,
            url = %url,
            queries = request.queries.len(),
            "sending query batch"
        );

        let response = self
            .client
            .post(url)
            .header(REQUEST_ID_HEADER, ctx.request_id.to_string())
            .header(self.identity_header.clone(), identity)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status == StatusCode::NOT_IMPLEMENTED {
            return Err(PluginError::NotImplemented);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PluginError::Failed(anyhow::anyhow!(
                "backend returned {}: {}",
                status,
                body
            )));
        }
        response.json::<QueryDataResponse>().await.map_err(|e| {
            PluginError::Failed(anyhow::Error::new(e).context("Invalid query response"))
        })
    }

    async fn call_resource(
        &self,
        ctx: &RequestContext,
        request: ResourceCallRequest,
        sender: &mut dyn ResourceResponseSender,
    ) -> Result<(), PluginError> {
        let identity =
            serialize_identity(&request.caller).map_err(|e| PluginError::Failed(e.into()))?;
        let url = self.url(
            &format!("resources/{}", request.sub_path),
            request.query.as_deref(),
        )?;
        debug!(
            request_id = %ctx.request_id,
            plugin = %request.plugin.plugin_id,
            url = %url,
            "calling resource"
        );

        let mut headers = request.headers;
        headers.remove(header::HOST);
        headers.insert(self.identity_header.clone(), identity);

        let response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .header(REQUEST_ID_HEADER, ctx.request_id.to_string())
            .body(request.body)
            .send()
            .await
            .map_err(request_error)?;

        sender
            .send(ResourcePart::Head {
                status: response.status(),
                headers: response.headers().clone(),
            })
            .await?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| PluginError::Failed(e.into()))?;
            sender.send(ResourcePart::Chunk(chunk)).await?;
        }
        Ok(())
    }
}
