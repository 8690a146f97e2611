//! Fossclaw error types

use thiserror::Error;

/// Fossclaw error type, covering the taxonomy of kinds in the bridge's
/// error handling design: malformed wire frames, socket lifecycle,
/// storage, upstream adapters, and HTTP request handling.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame from an agent or browser socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket closed unexpectedly, or attach/detach bookkeeping failed.
    #[error("wire error: {0}")]
    Wire(String),

    /// Agent child process exited, or launcher state transition failed.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Session or cron store read/write failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Alternate-provider adapter failure (health check, SSE, JSON-RPC).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Request body or query failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or expired auth cookie.
    #[error("unauthorized")]
    Unauthorized,

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Endpoint depends on an optional collaborator that isn't wired up.
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error from an alternate-provider adapter's upstream calls.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error that doesn't fit another kind.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for Fossclaw operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map to the HTTP status code spec §7 assigns to this error kind.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DependencyMissing(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Protocol(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::DependencyMissing("x".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            Error::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
