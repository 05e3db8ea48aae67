//! Reverse-proxy director for plugin and datasource routes.
//!
//! [`ProxyBuilder`] turns an inbound request into an outbound one aimed at a
//! route's upstream, and relays the upstream response. Two header rules are
//! hard invariants on both legs:
//!
//! - `Cookie`, `Set-Cookie` and the gateway's own credentials never reach a backend.
//! - `Set-Cookie` from a backend never reaches the client.
//!
//! The caller identity is added as a single trusted header on the outbound leg only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header};
use gateway_common::{CallerIdentity, GatewayError, RequestContext};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use reqwest::Url;
use tracing::debug;

use crate::auth::IDENTITY_HEADERS;

pub const DEFAULT_IDENTITY_HEADER: &str = "X-Caller-Context";

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Per-request proxy state; discarded once the response is written.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// Serialized caller identity, ready to be sent as a header value.
    pub caller_identity: HeaderValue,
    /// Final outbound URL, including the query string.
    pub upstream_url: Url,
    /// Inbound path after the proxy prefix, without a leading slash.
    pub relative_path: String,
}

/// Sends a fully built request to an upstream.
/// Real implementation: `ReqwestTransport`. Tests substitute a recording double.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, GatewayError>;
}

/// Streams requests and responses through a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(&self, request: Request<Body>) -> Result<Response<Body>, GatewayError> {
        let (parts, body) = request.into_parts();
        let url = Url::parse(&parts.uri.to_string())
            .map_err(|e| GatewayError::internal_with("Invalid upstream URL", e))?;

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    GatewayError::UpstreamUnavailable {
                        detail: e.to_string(),
                    }
                } else {
                    GatewayError::UpstreamGenericFailure { source: e.into() }
                }
            })?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Builds and forwards proxied requests.
#[derive(Clone)]
pub struct ProxyBuilder {
    identity_header: HeaderName,
    transport: Arc<dyn UpstreamTransport>,
}

impl ProxyBuilder {
    pub fn new(
        identity_header: &str,
        transport: Arc<dyn UpstreamTransport>,
    ) -> anyhow::Result<Self> {
        let identity_header = HeaderName::from_bytes(identity_header.as_bytes())
            .with_context(|| format!("Invalid identity header name '{}'", identity_header))?;
        Ok(Self {
            identity_header,
            transport,
        })
    }

    /// Serialize the caller and compute the outbound URL.
    ///
    /// `route_relative` is the part of `relative_path` left after the matched
    /// route's own path; it is what gets joined onto `upstream_base`.
    pub fn context(
        &self,
        caller: &CallerIdentity,
        upstream_base: &Url,
        relative_path: &str,
        route_relative: &str,
        query: Option<&str>,
    ) -> Result<ProxyContext, GatewayError> {
        let caller_identity = serialize_identity(caller)?;
        let upstream_url = join_url(upstream_base, route_relative, query)?;
        Ok(ProxyContext {
            caller_identity,
            upstream_url,
            relative_path: relative_path.to_string(),
        })
    }

    /// Build the outbound request: new destination, sanitized headers, then the
    /// identity header and the route's headers.
    pub fn build_request(
        &self,
        ctx: &ProxyContext,
        inbound: Request<Body>,
        route_headers: &[(HeaderName, HeaderValue)],
    ) -> Result<Request<Body>, GatewayError> {
        let (mut parts, body) = inbound.into_parts();

        parts.uri = ctx
            .upstream_url
            .as_str()
            .parse()
            .map_err(|e| GatewayError::internal_with("Invalid upstream URL", e))?;
        parts.version = Default::default();
        sanitize_request_headers(&mut parts.headers);
        parts.headers.remove(header::HOST);
        parts.headers.remove(&self.identity_header);

        for (name, value) in route_headers {
            parts.headers.insert(name.clone(), value.clone());
        }
        parts
            .headers
            .insert(self.identity_header.clone(), ctx.caller_identity.clone());

        Ok(Request::from_parts(parts, body))
    }

    /// Send the outbound request and relay the response without `Set-Cookie`.
    pub async fn forward(
        &self,
        rctx: &RequestContext,
        outbound: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        debug!(
            request_id = %rctx.request_id,
            method = %outbound.method(),
            upstream = %outbound.uri(),
            "forwarding proxied request"
        );
        let mut response = rctx.run(self.transport.send(outbound)).await??;
        sanitize_response_headers(response.headers_mut());
        Ok(response)
    }
}

/// The identity header value as ASCII-only JSON.
/// Fails closed: an unserializable identity is an error, never omitted.
pub fn serialize_identity(caller: &CallerIdentity) -> Result<HeaderValue, GatewayError> {
    let json = serde_json::to_string(caller)
        .map_err(|e| GatewayError::internal_with("Failed to serialize caller identity", e))?;
    HeaderValue::from_str(&escape_non_ascii(&json))
        .map_err(|e| GatewayError::internal_with("Caller identity is not a valid header value", e))
}

/// Rewrite non-ASCII characters as `\uXXXX` escapes. Only valid on JSON text,
/// where such characters can only appear inside strings.
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Characters escaped when a decoded segment is written back into a URL path.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

fn relative_segment_error() -> GatewayError {
    GatewayError::BadRequest("Proxy path must not contain relative segments".into())
}

/// Percent-decode a raw request path into its canonical `a/b/c` form.
///
/// Route matching and authorization run on this form, so a segment that
/// decodes to `.` or `..`, or that smuggles a separator (`%2f`, `%5c`), is
/// rejected rather than reinterpreted later by URL normalization.
pub fn canonical_path(raw: &str) -> Result<String, GatewayError> {
    let mut segments = Vec::new();
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| GatewayError::BadRequest("Proxy path is not valid UTF-8".into()))?;
        if decoded == "." || decoded == ".." || decoded.contains(['/', '\\']) {
            return Err(relative_segment_error());
        }
        segments.push(decoded.into_owned());
    }
    Ok(segments.join("/"))
}

/// Join a canonical `remainder` onto the base URL's path, segment by segment.
///
/// Each segment is re-encoded, so the result always stays under the base path.
pub fn join_url(base: &Url, remainder: &str, query: Option<&str>) -> Result<Url, GatewayError> {
    let segments: Vec<&str> = remainder.split('/').filter(|s| !s.is_empty()).collect();
    if segments
        .iter()
        .any(|s| *s == ".." || *s == "." || s.contains('\\'))
    {
        return Err(relative_segment_error());
    }

    let mut url = base.clone();
    if !segments.is_empty() {
        let base_path = base.path().trim_end_matches('/');
        let encoded: Vec<String> = segments
            .iter()
            .map(|s| utf8_percent_encode(s, PATH_SEGMENT).to_string())
            .collect();
        url.set_path(&format!("{}/{}", base_path, encoded.join("/")));
        if !url.path().starts_with(base_path) {
            return Err(relative_segment_error());
        }
    }
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.set_query(Some(q));
    }
    Ok(url)
}

/// Remove session credentials and connection-scoped headers from an inbound request.
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    headers.remove(header::COOKIE);
    headers.remove(header::SET_COOKIE);
    headers.remove(header::AUTHORIZATION);
    strip_common(headers);
    for name in IDENTITY_HEADERS {
        headers.remove(*name);
    }
}

/// Remove cookies and connection-scoped headers from a backend response.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    headers.remove(header::SET_COOKIE);
    strip_common(headers);
}

fn strip_common(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP_HEADERS) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// The raw path after the first `skip` segments, e.g. `("/api/plugin-proxy/a/b/c", 3) -> "b/c"`.
pub fn path_after_segments(path: &str, skip: usize) -> String {
    path.trim_start_matches('/')
        .splitn(skip + 1, '/')
        .nth(skip)
        .unwrap_or("")
        .trim_matches('/')
        .to_string()
}
