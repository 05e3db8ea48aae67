use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::PluginError;
use crate::identity::CallerIdentity;

/// Identifies the plugin (and the org it runs for) targeted by a resource call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRef {
    pub plugin_id: String,
    pub org_id: i64,
}

/// An opaque, plugin-defined HTTP-like call. Created per request and never persisted.
#[derive(Debug, Clone)]
pub struct ResourceCallRequest {
    pub plugin: PluginRef,
    pub caller: CallerIdentity,
    pub method: Method,
    /// Everything after `/resources/`, without a leading slash.
    pub sub_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResourceCallRequest {
    /// The sub-path with its query string, as sent to the backend.
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => format!("{}?{}", self.sub_path, query),
            None => self.sub_path.clone(),
        }
    }
}

/// One piece of a streamed resource response.
///
/// A backend sends exactly one `Head` first, followed by any number of
/// `Chunk`s. A `Chunk` sent without a preceding `Head` implies `200 OK`.
#[derive(Debug, Clone)]
pub enum ResourcePart {
    Head { status: StatusCode, headers: HeaderMap },
    Chunk(Bytes),
}

/// Where a plugin backend writes its resource response.
///
/// `send` waits while the client is slower than the backend, and fails once
/// the client is gone so the backend can stop producing.
#[async_trait]
pub trait ResourceResponseSender: Send {
    async fn send(&mut self, part: ResourcePart) -> Result<(), PluginError>;
}
