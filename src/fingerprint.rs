//! Request fingerprinting
//!
//! A fingerprint is the SHA-256 of a canonical rendering of the request:
//!
//! ```text
//! method \0 uri \0 version \0
//! (name \0 (value \0)* \0)*      header names sorted, values in received order
//! body \0
//! ```
//!
//! Every field is terminated, so shifting bytes between adjacent fields changes the digest.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::CONTENT_LENGTH;
use hyper::{HeaderMap, Method, Request, Uri, Version};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

const TERMINATOR: [u8; 1] = [0];

/// Length of a hex-encoded SHA-256 digest
pub const KEY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Failed to read request body: {0}")]
    Body(#[from] io::Error),

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),
}

/// Lowercase hex SHA-256 identifying a cacheable request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// Accept an existing key, checking its shape
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let valid = s.len() == KEY_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(FingerprintError::InvalidKey(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for CacheKey {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update(bytes);
    hasher.update(TERMINATOR);
}

/// Fingerprint a request whose body is already buffered
pub fn digest_request_parts(
    method: &Method,
    uri: &Uri,
    version: Version,
    headers: &HeaderMap,
    body: &[u8],
) -> CacheKey {
    let mut hasher = Sha256::new();

    field(&mut hasher, method.as_str().as_bytes());
    field(&mut hasher, uri.to_string().as_bytes());
    field(&mut hasher, format!("{:?}", version).as_bytes());

    let mut names: Vec<_> = headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    for name in names {
        field(&mut hasher, name.as_str().as_bytes());
        for value in headers.get_all(name) {
            field(&mut hasher, value.as_bytes());
        }
        hasher.update(TERMINATOR);
    }

    field(&mut hasher, body);

    CacheKey::from_digest(&hasher.finalize())
}

/// Buffer the body of `request` and fingerprint it.
///
/// Returns the key together with the request rebuilt around the buffered body, so it can
/// still be forwarded.
pub async fn fingerprint<B>(request: Request<B>) -> Result<(CacheKey, Request<Bytes>), FingerprintError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map_err(io::Error::other)?
        .to_bytes();

    if let Some(declared) = declared {
        if (body.len() as u64) < declared {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended after {} of {} declared bytes", body.len(), declared),
            )
            .into());
        }
    }

    let key = digest_request_parts(&parts.method, &parts.uri, parts.version, &parts.headers, &body);
    Ok((key, Request::from_parts(parts, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn request(headers: &[(&str, &str)], body: &'static str) -> Request<Full<Bytes>> {
        let mut builder = Request::post("http://example.com/repo.git/git-upload-pack");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
    }

    #[tokio::test]
    async fn test_header_order_does_not_matter() {
        let (a, _) = fingerprint(request(&[("A", "1"), ("B", "2")], "body")).await.unwrap();
        let (b, _) = fingerprint(request(&[("B", "2"), ("A", "1")], "body")).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_body_changes_key() {
        let (a, _) = fingerprint(request(&[("A", "1")], "one")).await.unwrap();
        let (b, _) = fingerprint(request(&[("A", "1")], "two")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_body_is_preserved_for_forwarding() {
        let (_, req) = fingerprint(request(&[], "payload")).await.unwrap();
        assert_eq!(&req.body()[..], b"payload");
        assert_eq!(req.method(), Method::POST);
    }

    #[tokio::test]
    async fn test_short_body_is_an_error() {
        let req = request(&[("Content-Length", "100")], "short");
        match fingerprint(req).await {
            Err(FingerprintError::Body(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected body error, got {:?}", other.map(|(k, _)| k)),
        }
    }

    #[test]
    fn test_field_boundaries_are_significant() {
        let headers = HeaderMap::new();
        let uri: Uri = "/x".parse().unwrap();
        let a = digest_request_parts(&Method::GET, &uri, Version::HTTP_11, &headers, b"ab");

        let mut split = HeaderMap::new();
        split.insert("x-a", "b".parse().unwrap());
        let b = digest_request_parts(&Method::GET, &uri, Version::HTTP_11, &split, b"");
        assert_ne!(a, b);

        let c = digest_request_parts(&Method::GET, &uri, Version::HTTP_10, &headers, b"ab");
        assert_ne!(a, c);
    }

    #[test]
    fn test_multi_value_order_matters() {
        let uri: Uri = "/x".parse().unwrap();
        let mut first = HeaderMap::new();
        first.append("accept", "a".parse().unwrap());
        first.append("accept", "b".parse().unwrap());
        let mut second = HeaderMap::new();
        second.append("accept", "b".parse().unwrap());
        second.append("accept", "a".parse().unwrap());

        let a = digest_request_parts(&Method::GET, &uri, Version::HTTP_11, &first, b"");
        let b = digest_request_parts(&Method::GET, &uri, Version::HTTP_11, &second, b"");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_shape() {
        let key = digest_request_parts(
            &Method::GET,
            &"/".parse().unwrap(),
            Version::HTTP_11,
            &HeaderMap::new(),
            b"",
        );
        assert_eq!(key.as_str().len(), KEY_LEN);
        assert_eq!(CacheKey::parse(key.as_str()).unwrap(), key);
        assert!(CacheKey::parse("ABC").is_err());
        assert!(CacheKey::parse(&"G".repeat(KEY_LEN)).is_err());
    }
}
