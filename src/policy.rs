//! Caching policy
//!
//! Which requests are eligible for the cache, which upstreams they may go to, and which
//! responses may be stored.

use hyper::header::{HeaderMap, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode, Uri};

use crate::cache::HeaderFields;

const GIT_UPLOAD_PACK_REQUEST: &str = "application/x-git-upload-pack-request";
const GIT_UPLOAD_PACK_RESULT: &str = "application/x-git-upload-pack-result";

/// Upload-pack negotiations at or above this size are forwarded uncached
pub const MAX_GIT_PACK_REQUEST_BYTES: u64 = 65536;

// ============================================================================
// Responses
// ============================================================================

/// Default predicate: only complete `200 OK` responses that do not forbid storage
pub fn cacheable_response(status: StatusCode, headers: &HeaderFields) -> bool {
    if status != StatusCode::OK {
        return false;
    }

    let no_store = headers
        .get("cache-control")
        .into_iter()
        .flatten()
        .flat_map(|value| value.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"));

    !no_store
}

// ============================================================================
// Requests
// ============================================================================

fn header_is(headers: &HeaderMap, name: impl hyper::header::AsHeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

/// Requests that carry their own caching or credentials are never served from the cache
fn client_allows_caching(headers: &HeaderMap) -> bool {
    !headers.contains_key(CACHE_CONTROL) && !headers.contains_key(AUTHORIZATION)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Git smart-HTTP upload-pack negotiation
pub fn cacheable_git_pack_request<B>(request: &Request<B>) -> bool {
    let headers = request.headers();
    let small_body = declared_length(headers)
        .is_some_and(|len| len > 0 && len < MAX_GIT_PACK_REQUEST_BYTES);

    small_body
        && request.method() == Method::POST
        && header_is(headers, CONTENT_TYPE, GIT_UPLOAD_PACK_REQUEST)
        && header_is(headers, ACCEPT, GIT_UPLOAD_PACK_RESULT)
        && client_allows_caching(headers)
}

/// Debian package download from a pool directory
pub fn cacheable_deb_pool_request<B>(request: &Request<B>) -> bool {
    let path = request.uri().path();

    request.method() == Method::GET
        && client_allows_caching(request.headers())
        && path.ends_with(".deb")
        && path.contains("/pool/")
}

// ============================================================================
// Upstream allowlist
// ============================================================================

/// Hosts a request category may be cached for.
///
/// Parsed from a comma-separated list. `*` allows every host; an empty list allows none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upstreams {
    hosts: Vec<String>,
    any: bool,
}

impl Upstreams {
    pub fn parse(list: &str) -> Self {
        let mut upstreams = Self::default();
        for host in list.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            if host == "*" {
                upstreams.any = true;
            } else {
                upstreams.hosts.push(host.to_ascii_lowercase());
            }
        }
        upstreams
    }

    /// Whether `uri` points at a listed host. An entry may carry a port to pin it.
    pub fn is_listed(&self, uri: &Uri) -> bool {
        let Some(host) = uri.host() else {
            return false;
        };
        if self.any {
            return true;
        }

        let host = host.to_ascii_lowercase();
        let authority = uri.authority().map(|a| a.as_str().to_ascii_lowercase());
        self.hosts
            .iter()
            .any(|listed| *listed == host || authority.as_deref() == Some(listed.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && !self.any
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_request(extra: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::post("https://github.com/org/repo.git/git-upload-pack")
            .header(CONTENT_TYPE, GIT_UPLOAD_PACK_REQUEST)
            .header(ACCEPT, GIT_UPLOAD_PACK_RESULT);
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_cacheable_response() {
        let mut headers = HeaderFields::new();
        headers.add("Content-Type", "application/octet-stream");
        assert!(cacheable_response(StatusCode::OK, &headers));
        assert!(!cacheable_response(StatusCode::NOT_FOUND, &headers));
        assert!(!cacheable_response(StatusCode::PARTIAL_CONTENT, &headers));

        headers.add("Cache-Control", "max-age=0, No-Store");
        assert!(!cacheable_response(StatusCode::OK, &headers));
    }

    #[test]
    fn test_git_pack_request() {
        assert!(cacheable_git_pack_request(&git_request(&[("Content-Length", "120")])));
        assert!(!cacheable_git_pack_request(&git_request(&[])));
        assert!(!cacheable_git_pack_request(&git_request(&[("Content-Length", "0")])));
        assert!(!cacheable_git_pack_request(&git_request(&[("Content-Length", "65536")])));
        assert!(!cacheable_git_pack_request(&git_request(&[
            ("Content-Length", "120"),
            ("Authorization", "Basic eDp5"),
        ])));
        assert!(!cacheable_git_pack_request(&git_request(&[
            ("Content-Length", "120"),
            ("Cache-Control", "no-cache"),
        ])));

        let get = Request::get("https://github.com/org/repo.git/info/refs")
            .header(CONTENT_LENGTH, "120")
            .body(())
            .unwrap();
        assert!(!cacheable_git_pack_request(&get));
    }

    #[test]
    fn test_deb_pool_request() {
        let deb = Request::get("http://archive.ubuntu.com/ubuntu/pool/main/c/curl/curl_8.5.0_amd64.deb")
            .body(())
            .unwrap();
        assert!(cacheable_deb_pool_request(&deb));

        let index = Request::get("http://archive.ubuntu.com/ubuntu/dists/noble/Release")
            .body(())
            .unwrap();
        assert!(!cacheable_deb_pool_request(&index));

        let head = Request::head("http://archive.ubuntu.com/ubuntu/pool/main/c/curl/curl.deb")
            .body(())
            .unwrap();
        assert!(!cacheable_deb_pool_request(&head));
    }

    #[test]
    fn test_upstreams() {
        let upstreams = Upstreams::parse(" GitHub.com, gitlab.example.com:8443 ,");
        assert_eq!(upstreams.hosts(), ["github.com", "gitlab.example.com:8443"]);

        assert!(upstreams.is_listed(&"https://github.com/org/repo.git".parse().unwrap()));
        assert!(upstreams.is_listed(&"https://gitlab.example.com:8443/x".parse().unwrap()));
        assert!(!upstreams.is_listed(&"https://gitlab.example.com/x".parse().unwrap()));
        assert!(!upstreams.is_listed(&"https://github.com.evil.net/x".parse().unwrap()));
        assert!(!upstreams.is_listed(&"/relative".parse().unwrap()));

        assert!(Upstreams::parse("").is_empty());
        assert!(Upstreams::parse("*").is_listed(&"http://anything.test/".parse().unwrap()));
    }
}
