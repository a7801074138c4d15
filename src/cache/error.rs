use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::config::ConfigError;
use super::key::ResourceIdentity;
use crate::http::{Response, StatusCode};

/// Failures reported by a [`CacheBackend`](super::CacheBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode a variant record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt variant record at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: &'static str },
}

/// Errors the response cache surfaces to the request-handling layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no representation of {identity} is acceptable")]
    NotAcceptable { identity: ResourceIdentity },

    #[error("failed to invalidate cached representations of {identity}: {source}")]
    InvalidationFailed {
        identity: ResourceIdentity,
        #[source]
        source: BackendError,
    },

    #[error("handler for {identity} did not complete within {after:?}")]
    HandlerTimedOut {
        identity: ResourceIdentity,
        after: Duration,
    },

    #[error("cache backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// The HTTP status a client sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotAcceptable { .. } => StatusCode::NotAcceptable,
            Self::InvalidationFailed { .. } => StatusCode::ServiceUnavailable,
            Self::HandlerTimedOut { .. } => StatusCode::GatewayTimeout,
            Self::Backend(_) | Self::Config(_) => StatusCode::InternalServerError,
        }
    }

    /// Renders the error as a plain-text response.
    pub fn into_response(self) -> Response {
        let status = self.status();
        Response::new(status).body(status.canonical_reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let identity = ResourceIdentity::new("/cache");
        assert_eq!(
            CacheError::NotAcceptable {
                identity: identity.clone()
            }
            .status(),
            StatusCode::NotAcceptable
        );
        let err = CacheError::InvalidationFailed {
            identity: identity.clone(),
            source: BackendError::Io(std::io::Error::other("disk gone")),
        };
        assert_eq!(err.status(), StatusCode::ServiceUnavailable);
        assert!(err.to_string().contains("/cache"));
        let err = CacheError::HandlerTimedOut {
            identity,
            after: Duration::from_millis(50),
        };
        assert_eq!(err.into_response().status(), StatusCode::GatewayTimeout);
    }
}
