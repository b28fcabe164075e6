//! Error types for storehouse

use hyper::StatusCode;
use thiserror::Error;

use crate::cache::CacheError;
use crate::fingerprint::FingerprintError;

#[derive(Error, Debug)]
pub enum StorehouseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorehouseError {
    /// Status returned to the client when a request fails with this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Fingerprint(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) | Self::Cache(CacheError::Fetch(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorehouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            StorehouseError::BadRequest("no host".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StorehouseError::Cache(CacheError::Fetch("refused".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            StorehouseError::Cache(CacheError::Truncated).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
