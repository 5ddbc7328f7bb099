//! Error types for pixel-indexer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Ledger Errors ===
    #[error("Ledger RPC error: {0}")]
    Ledger(String),

    #[error("Rate limited by ledger endpoint: {0}")]
    RateLimited(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Watch subscription unavailable: {0}")]
    WatchUnavailable(String),

    // === Ingestion Errors ===
    #[error("Malformed ledger entry: {0}")]
    Malformed(String),

    // === Query Errors ===
    #[error("Coordinate out of bounds: ({x}, {y}) outside [0, {resolution})")]
    OutOfBounds { x: u64, y: u64, resolution: u32 },

    #[error("Region too large: {area} pixels requested, max {max}")]
    RegionTooLarge { area: u64, max: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Snapshot Errors ===
    #[error("Corrupted snapshot: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === Serialization ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::RateLimited(_)
                | Error::Ledger(_)
        )
    }

    /// Caller supplied bad input (never retried, reported as 400)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::OutOfBounds { .. } | Error::RegionTooLarge { .. } | Error::InvalidRequest(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::OutOfBounds { .. } | Error::RegionTooLarge { .. } | Error::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.to_http_status();
        (
            status,
            axum::Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else if e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            Error::RateLimited(e.to_string())
        } else {
            Error::Ledger(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WatchUnavailable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("rpc".into()).is_retryable());
        assert!(Error::RateLimited("429".into()).is_retryable());
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(Error::Ledger("header not found".into()).is_retryable());

        assert!(!Error::Malformed("missing x".into()).is_retryable());
        assert!(!Error::InvalidRequest("limit".into()).is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }

    #[test]
    fn test_http_status() {
        let oob = Error::OutOfBounds {
            x: 5000,
            y: 0,
            resolution: 1024,
        };
        assert!(oob.is_caller_error());
        assert_eq!(oob.to_http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::RegionTooLarge { area: 10, max: 1 }.to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("pixel".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Corrupted("magic".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
