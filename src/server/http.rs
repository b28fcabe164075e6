//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Every request is either served through
//! the response cache or passed straight through to its upstream.
//!
//! Two request shapes are accepted:
//! - proxy mode: `GET http://host/path HTTP/1.1`, forwarded as-is
//! - get mode: `GET /host/path HTTP/1.1`, rewritten to `https://host/path`

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheError, DiskCache, Fetch, LookupStatus, MemoryCache, ResponseCache};
use crate::config::{self, Args, CacheBackend};
use crate::fingerprint::fingerprint;
use crate::policy::{self, Upstreams};
use crate::server::forward::{is_hop_by_hop_name, ForwardRequest, Forwarder};
use crate::types::{Result, StorehouseError};

pub type BoxBody = UnsyncBoxBody<Bytes, io::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Response cache selected by `--cache-backend`
    pub cache: Arc<dyn ResponseCache>,
    pub forwarder: Forwarder,
    /// Hosts git upload-pack responses may be cached for
    pub git_pack_upstreams: Upstreams,
    /// Hosts Debian pool downloads may be cached for
    pub deb_pool_upstreams: Upstreams,
}

impl AppState {
    /// Build state from configuration, opening the cache backend
    pub async fn new(args: Args) -> Result<Self> {
        let cache: Arc<dyn ResponseCache> = match args.cache_backend {
            CacheBackend::Disk => Arc::new(DiskCache::open(&args.cache_directory).await?),
            CacheBackend::Memory => Arc::new(MemoryCache::new()),
        };

        if args.clear_cache {
            cache.clear().await?;
        }

        let forwarder = Forwarder::new(args.request_timeout(), config::banner())?;

        Ok(Self {
            git_pack_upstreams: args.git_pack_upstreams(),
            deb_pool_upstreams: args.deb_pool_upstreams(),
            cache,
            forwarder,
            args,
        })
    }

    /// Whether `request` may be served through the cache
    pub fn is_cacheable<B>(&self, request: &Request<B>) -> bool {
        let uri = request.uri();
        (policy::cacheable_git_pack_request(request) && self.git_pack_upstreams.is_listed(uri))
            || (policy::cacheable_deb_pool_request(request)
                && self.deb_pool_upstreams.is_listed(uri))
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    serve(listener, state).await
}

/// Accept connections on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    info!("Storehouse listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();

    if method == Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "CONNECT tunnelling is not supported",
        ));
    }

    let result = match rewrite_get_mode(req) {
        Ok(req) if state.is_cacheable(&req) => serve_cacheable(&state, req).await,
        Ok(req) => serve_passthrough(&state, req).await,
        Err(e) => Err(e),
    };

    let (response, uri) = match result {
        Ok(served) => served,
        Err(e) => {
            warn!(client = %addr, method = %method, error = %e, "Request failed");
            (text_response(e.status_code(), &e.to_string()), None)
        }
    };

    if !state.args.quiet {
        let uri = uri.map(|u| u.to_string()).unwrap_or_default();
        info!(
            client = %addr,
            method = %method,
            uri = %uri,
            status = response.status().as_u16(),
            "Request served"
        );
    }

    Ok(response)
}

/// Rewrite a get-mode request (`/host/path`) into an absolute `https://host/path` request.
/// Proxy-mode requests already carry a host and pass through untouched.
pub fn rewrite_get_mode<B>(mut req: Request<B>) -> Result<Request<B>> {
    if req.uri().host().is_some() {
        return Ok(req);
    }

    let uri = get_mode_uri(req.uri())?;
    if let Some(host) = uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
        req.headers_mut().insert(HOST, host);
    }
    *req.uri_mut() = uri;
    Ok(req)
}

fn get_mode_uri(uri: &Uri) -> Result<Uri> {
    let path = uri.path().trim_start_matches('/');
    let (host, rest) = path.split_once('/').unwrap_or((path, ""));
    if host.is_empty() {
        return Err(StorehouseError::BadRequest(format!(
            "no upstream host in request path {}",
            uri.path()
        )));
    }

    let target = match uri.query() {
        Some(query) => format!("https://{}/{}?{}", host, rest, query),
        None => format!("https://{}/{}", host, rest),
    };
    target
        .parse()
        .map_err(|e| StorehouseError::BadRequest(format!("invalid get-mode target: {}", e)))
}

/// Upstream fetch for one fingerprinted request
struct UpstreamFetch {
    forwarder: Forwarder,
    request: ForwardRequest,
    forwarded: Arc<AtomicBool>,
}

impl Fetch for UpstreamFetch {
    fn fetch(&self) -> BoxFuture<'static, std::result::Result<CacheEntry, CacheError>> {
        let forwarder = self.forwarder.clone();
        let request = self.request.clone();
        let forwarded = Arc::clone(&self.forwarded);
        Box::pin(async move {
            forwarded.store(true, Ordering::SeqCst);
            forwarder
                .forward(request)
                .await
                .map_err(|e| CacheError::Fetch(e.to_string()))
        })
    }
}

async fn serve_cacheable(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<(Response<BoxBody>, Option<Uri>)> {
    let (key, req) = fingerprint(req).await?;
    let request = ForwardRequest::from_request(req);
    let (method, uri) = (request.method.clone(), request.uri.clone());

    let forwarded = Arc::new(AtomicBool::new(false));
    let fetch = Arc::new(UpstreamFetch {
        forwarder: state.forwarder.clone(),
        request,
        forwarded: Arc::clone(&forwarded),
    });

    let lookup = match state.cache.get(key.as_str(), fetch).await {
        Ok(lookup) => lookup,
        Err(e) => {
            error!(method = %method, uri = %uri, key = %key, error = %e, "Error making cacheable request");
            return Err(e.into());
        }
    };

    match &lookup.status {
        LookupStatus::Uncacheable => {
            info!(method = %method, uri = %uri, key = %key, status = %lookup.entry.status, "Request was not actually cacheable");
        }
        LookupStatus::Unpersisted(e) => {
            warn!(method = %method, uri = %uri, key = %key, error = %e, "Response served but not saved to cache");
        }
        _ if forwarded.load(Ordering::SeqCst) => {
            info!(method = %method, uri = %uri, key = %key, "Request saved to cache");
        }
        _ => {
            info!(method = %method, uri = %uri, key = %key, "Request served from cache");
        }
    }

    Ok((entry_response(lookup.entry), Some(uri)))
}

async fn serve_passthrough(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<(Response<BoxBody>, Option<Uri>)> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| StorehouseError::Io(io::Error::other(e)))?
        .to_bytes();
    let request = ForwardRequest::from_request(Request::from_parts(parts, body));
    let uri = request.uri.clone();

    debug!(method = %request.method, uri = %uri, "Passing request through");
    let entry = state.forwarder.forward(request).await?;
    Ok((entry_response(entry), Some(uri)))
}

/// Turn a cache entry into a streaming client response
pub fn entry_response(entry: CacheEntry) -> Response<BoxBody> {
    let mut response = Response::new(
        StreamBody::new(entry.body.map_ok(Frame::data)).boxed_unsync(),
    );
    *response.status_mut() = entry.status;

    let headers = response.headers_mut();
    for (name, values) in entry.headers.iter() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if is_hop_by_hop_name(name.as_str()) {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    if let Some(len) = entry.content_length {
        if !headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
    }

    response
}

fn text_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(format!("{}\n", message)))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
