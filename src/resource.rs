//! Streaming bridge between HTTP clients and plugin resource handlers.
//!
//! The backend writes into a bounded channel through [`ResourceResponseSender`];
//! the HTTP response body reads from the other end. A slow client therefore
//! stalls the backend once the channel is full, and nothing is buffered
//! beyond the channel capacity.
//!
//! No status is written to the client until the backend has produced its
//! first part, so a failure before that point still gets a proper error
//! envelope instead of a half-written success.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Response, StatusCode};
use gateway_common::{
    CancelReason, GatewayError, PluginError, RequestContext, ResourceCallRequest, ResourcePart,
    ResourceResponseSender,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::{debug, error, warn};

use crate::plugin::PluginClients;
use crate::proxy::{canonical_path, sanitize_request_headers, sanitize_response_headers};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Where the outcome of a resource call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    /// The plugin backend produced the status or the error.
    Downstream,
    /// The gateway failed before or around the backend call.
    Bridge,
}

impl std::fmt::Display for StatusSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusSource::Downstream => write!(f, "downstream"),
            StatusSource::Bridge => write!(f, "bridge"),
        }
    }
}

impl StatusSource {
    fn of(err: &PluginError) -> Self {
        match err {
            PluginError::Failed(_) | PluginError::NotImplemented => StatusSource::Downstream,
            PluginError::Unavailable(_) | PluginError::Canceled(_) => StatusSource::Bridge,
        }
    }
}

/// A failed resource call, tagged with where it failed.
#[derive(Debug)]
pub struct BridgeError {
    pub error: GatewayError,
    pub source: StatusSource,
}

impl BridgeError {
    fn bridge(error: GatewayError) -> Self {
        Self {
            error,
            source: StatusSource::Bridge,
        }
    }
}

impl From<PluginError> for BridgeError {
    fn from(err: PluginError) -> Self {
        Self {
            source: StatusSource::of(&err),
            error: err.into(),
        }
    }
}

/// Sender half handed to the backend.
struct ChannelSender {
    tx: mpsc::Sender<ResourcePart>,
}

#[async_trait]
impl ResourceResponseSender for ChannelSender {
    async fn send(&mut self, part: ResourcePart) -> Result<(), PluginError> {
        self.tx
            .send(part)
            .await
            .map_err(|_| PluginError::Canceled(CancelReason::ClientGone))
    }
}

type BackendTask = JoinHandle<Result<(), PluginError>>;

/// State carried by the streaming response body.
struct BodyState {
    first: Option<Bytes>,
    rx: mpsc::Receiver<ResourcePart>,
    task: Option<BackendTask>,
    plugin_id: String,
    // Cancels the backend call once the body is dropped.
    _guard: DropGuard,
}

#[derive(Clone)]
pub struct ResourceCallBridge {
    plugins: Arc<PluginClients>,
    capacity: usize,
}

impl ResourceCallBridge {
    pub fn new(plugins: Arc<PluginClients>) -> Self {
        Self {
            plugins,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Forward `request` to its plugin and stream the response back.
    pub async fn call(
        &self,
        ctx: RequestContext,
        mut request: ResourceCallRequest,
    ) -> Result<Response<Body>, BridgeError> {
        let plugin_id = request.plugin.plugin_id.clone();
        let client = self.plugins.get(&plugin_id).ok_or_else(|| {
            BridgeError::bridge(GatewayError::NotFound(format!("Plugin {} not found", plugin_id)))
        })?;
        request.sub_path = canonical_path(&request.sub_path).map_err(BridgeError::bridge)?;
        sanitize_request_headers(&mut request.headers);

        debug!(
            request_id = %ctx.request_id,
            plugin = %plugin_id,
            method = %request.method,
            path = %request.sub_path,
            "dispatching resource call"
        );

        let (tx, mut rx) = mpsc::channel(self.capacity);
        let task_ctx = ctx.clone();
        let mut task = Some(tokio::spawn(async move {
            let mut sender = ChannelSender { tx };
            match task_ctx
                .run(client.call_resource(&task_ctx, request, &mut sender))
                .await
            {
                Ok(result) => result,
                Err(reason) => Err(PluginError::Canceled(reason)),
            }
        }));
        let guard = ctx.cancel.clone().drop_guard();

        let (status, mut headers, first) = match rx.recv().await {
            Some(ResourcePart::Head { status, headers }) => (status, headers, None),
            // A body without a head implies 200.
            Some(ResourcePart::Chunk(bytes)) => (StatusCode::OK, Default::default(), Some(bytes)),
            None => return Err(Self::finished_without_response(&plugin_id, task.take()).await),
        };
        sanitize_response_headers(&mut headers);

        let state = BodyState {
            first,
            rx,
            task,
            plugin_id,
            _guard: guard,
        };
        let mut response = Response::new(Body::from_stream(futures::stream::unfold(
            state,
            next_chunk,
        )));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response.extensions_mut().insert(StatusSource::Downstream);
        Ok(response)
    }

    /// The backend returned before sending anything.
    async fn finished_without_response(plugin_id: &str, task: Option<BackendTask>) -> BridgeError {
        let outcome = match task {
            Some(task) => task.await,
            None => Ok(Ok(())),
        };
        let err = match outcome {
            Ok(Ok(())) => BridgeError {
                error: GatewayError::UpstreamGenericFailure {
                    source: anyhow::anyhow!("plugin completed without sending a response"),
                },
                source: StatusSource::Downstream,
            },
            Ok(Err(err)) => BridgeError::from(err),
            Err(join) => BridgeError::bridge(GatewayError::internal_with(
                "Resource call task failed",
                join,
            )),
        };
        error!(
            plugin = %plugin_id,
            status_source = %err.source,
            error = %err.error,
            "resource call failed"
        );
        err
    }
}

async fn next_chunk(mut state: BodyState) -> Option<(Result<Bytes, std::io::Error>, BodyState)> {
    if let Some(first) = state.first.take() {
        return Some((Ok(first), state));
    }
    loop {
        match state.rx.recv().await {
            Some(ResourcePart::Chunk(bytes)) => return Some((Ok(bytes), state)),
            Some(ResourcePart::Head { .. }) => {
                warn!(
                    plugin = %state.plugin_id,
                    "ignoring response head sent after the body started"
                );
            }
            None => break,
        }
    }

    let task = state.task.take()?;
    match task.await {
        Ok(Ok(())) => {
            debug!(
                plugin = %state.plugin_id,
                status_source = %StatusSource::Downstream,
                "resource call completed"
            );
            None
        }
        Ok(Err(err)) => {
            let source = StatusSource::of(&err);
            error!(
                plugin = %state.plugin_id,
                status_source = %source,
                error = %err,
                "resource stream aborted"
            );
            Some((Err(std::io::Error::other(err.to_string())), state))
        }
        Err(join) => {
            error!(
                plugin = %state.plugin_id,
                status_source = %StatusSource::Bridge,
                error = %join,
                "resource task failed"
            );
            Some((Err(std::io::Error::other(join)), state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method, header};
    use gateway_common::{
        BackendRequest, CallerIdentity, PluginClient, PluginRef, QueryDataResponse,
    };
    use http_body_util::BodyExt;

    enum Behavior {
        /// Head, two chunks, then never finish.
        StreamThenHang,
        ChunkOnly,
        /// A single chunk echoing the sub-path the backend received.
        EchoPath,
        Fail(fn() -> PluginError),
        FailAfterHead,
    }

    struct FakeClient(Behavior);

    #[async_trait]
    impl PluginClient for FakeClient {
        async fn query_data(
            &self,
            _ctx: &RequestContext,
            _request: BackendRequest,
        ) -> Result<QueryDataResponse, PluginError> {
            Ok(QueryDataResponse::default())
        }

        async fn call_resource(
            &self,
            _ctx: &RequestContext,
            request: ResourceCallRequest,
            sender: &mut dyn ResourceResponseSender,
        ) -> Result<(), PluginError> {
            let mut headers = HeaderMap::new();
            headers.insert(header::SET_COOKIE, HeaderValue::from_static("plugin=1"));
            headers.insert("x-plugin", HeaderValue::from_static("yes"));
            match &self.0 {
                Behavior::StreamThenHang => {
                    sender
                        .send(ResourcePart::Head {
                            status: StatusCode::ACCEPTED,
                            headers,
                        })
                        .await?;
                    sender.send(ResourcePart::Chunk(Bytes::from("chunk-1"))).await?;
                    sender.send(ResourcePart::Chunk(Bytes::from("chunk-2"))).await?;
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Behavior::ChunkOnly => sender.send(ResourcePart::Chunk(Bytes::from("raw"))).await,
                Behavior::EchoPath => {
                    sender
                        .send(ResourcePart::Chunk(Bytes::from(request.sub_path)))
                        .await
                }
                Behavior::Fail(make) => Err(make()),
                Behavior::FailAfterHead => {
                    sender
                        .send(ResourcePart::Head {
                            status: StatusCode::OK,
                            headers,
                        })
                        .await?;
                    Err(PluginError::Failed(anyhow::anyhow!("crashed mid-stream")))
                }
            }
        }
    }

    fn bridge(behavior: Behavior) -> ResourceCallBridge {
        let plugins =
            PluginClients::new().with_client("test-app", Arc::new(FakeClient(behavior)));
        ResourceCallBridge::new(Arc::new(plugins))
    }

    fn request(plugin_id: &str, sub_path: &str) -> ResourceCallRequest {
        ResourceCallRequest {
            plugin: PluginRef {
                plugin_id: plugin_id.into(),
                org_id: 1,
            },
            caller: CallerIdentity::anonymous(1),
            method: Method::GET,
            sub_path: sub_path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn chunks_arrive_before_backend_finishes() {
        let response = bridge(Behavior::StreamThenHang)
            .call(RequestContext::new(), request("test-app", "stream"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(response.headers()["x-plugin"], "yes");
        assert_eq!(
            response.extensions().get::<StatusSource>(),
            Some(&StatusSource::Downstream)
        );

        let mut body = response.into_body();
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        let second = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, Bytes::from("chunk-1"));
        assert_eq!(second, Bytes::from("chunk-2"));
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_the_backend() {
        let ctx = RequestContext::new();
        let response = bridge(Behavior::StreamThenHang)
            .call(ctx.clone(), request("test-app", "stream"))
            .await
            .unwrap();
        assert!(!ctx.is_canceled());
        drop(response);
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn chunk_without_head_is_200() {
        let response = bridge(Behavior::ChunkOnly)
            .call(RequestContext::new(), request("test-app", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("raw"));
    }

    #[tokio::test]
    async fn backend_error_before_head_is_downstream() {
        let err = bridge(Behavior::Fail(|| PluginError::NotImplemented))
            .call(RequestContext::new(), request("test-app", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.error.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(err.source, StatusSource::Downstream);
    }

    #[tokio::test]
    async fn unreachable_backend_is_bridge_failure() {
        let err = bridge(Behavior::Fail(|| PluginError::Unavailable("refused".into())))
            .call(RequestContext::new(), request("test-app", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error.message_id(), Some("plugin.unavailable"));
        assert_eq!(err.source, StatusSource::Bridge);
    }

    #[tokio::test]
    async fn unknown_plugin_and_relative_path_are_rejected() {
        let b = bridge(Behavior::ChunkOnly);
        let err = b
            .call(RequestContext::new(), request("nope", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.error.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.source, StatusSource::Bridge);

        for sub_path in ["a/../../secret", "%2e%2e/query", "a/%2E%2e%2fquery", "x%5c..%5cy"] {
            let err = b
                .call(RequestContext::new(), request("test-app", sub_path))
                .await
                .unwrap_err();
            assert_eq!(err.error.status(), StatusCode::BAD_REQUEST, "{sub_path}");
            assert_eq!(err.source, StatusSource::Bridge);
        }
    }

    #[tokio::test]
    async fn backend_sees_decoded_sub_path() {
        let response = bridge(Behavior::EchoPath)
            .call(RequestContext::new(), request("test-app", "/series/%61bc%20d/"))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("series/abc d"));
    }

    #[tokio::test]
    async fn failure_after_head_aborts_the_body() {
        let response = bridge(Behavior::FailAfterHead)
            .call(RequestContext::new(), request("test-app", "x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
    }
}
