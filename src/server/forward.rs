//! Upstream forwarding
//!
//! Requests are replayed to the origin with reqwest. The client's User-Agent moves to
//! `X-Proxy-Client-Agent` and ours takes its place, so origins can tell proxied traffic apart.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, Uri};
use std::io;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheEntry, HeaderFields};
use crate::types::{Result, StorehouseError};

pub const X_PROXY_CLIENT_AGENT: &str = "x-proxy-client-agent";

/// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_name(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Whether `name` must be dropped when relaying a message carrying `headers`
pub fn is_hop_by_hop(name: &str, headers: &HeaderMap) -> bool {
    if is_hop_by_hop_name(name) {
        return true;
    }
    // Headers named by Connection are connection-scoped too
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|listed| listed.trim().eq_ignore_ascii_case(name))
}

/// Buffered request that can be sent upstream any number of times
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn from_request(request: Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    banner: String,
}

impl Forwarder {
    pub fn new(timeout: Duration, banner: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, banner })
    }

    /// Headers sent upstream for `request`
    pub fn upstream_headers(&self, request: &ForwardRequest) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
        for (name, value) in &request.headers {
            if *name == HOST || is_hop_by_hop(name.as_str(), &request.headers) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(agent) = request.headers.get(USER_AGENT) {
            headers.insert(HeaderName::from_static(X_PROXY_CLIENT_AGENT), agent.clone());
        }
        if let Ok(banner) = HeaderValue::from_str(&self.banner) {
            headers.insert(USER_AGENT, banner);
        }
        headers
    }

    /// Send `request` upstream and describe the response as a cache entry
    pub async fn forward(&self, request: ForwardRequest) -> Result<CacheEntry> {
        if request.uri.host().is_none() {
            return Err(StorehouseError::BadRequest(format!(
                "no upstream host in {}",
                request.uri
            )));
        }

        debug!(method = %request.method, uri = %request.uri, "Proxying request upstream");

        let headers = self.upstream_headers(&request);
        let response = self
            .client
            .request(request.method, request.uri.to_string())
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let content_length = response.content_length();
        let mut fields = HeaderFields::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str(), response.headers()) {
                continue;
            }
            match value.to_str() {
                Ok(value) => fields.add(name.as_str(), value),
                Err(_) => debug!(header = %name, "Dropping non-UTF-8 upstream header value"),
            }
        }

        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        let mut entry = CacheEntry::new(status, fields, body);
        entry.content_length = content_length;
        Ok(entry)
    }
}
