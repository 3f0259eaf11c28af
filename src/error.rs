use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Spool balancer
#[derive(Error, Debug)]
pub enum SpoolError {
    // Upstream pool errors
    #[error("No upstreams available")]
    NoUpstreamsAvailable,

    #[error("Upstream connection failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("Upstream request failed: {0}")]
    UpstreamRequestFailed(String),

    #[error("Operation timed out")]
    Timeout,

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Spool operations
pub type Result<T> = std::result::Result<T, SpoolError>;

impl SpoolError {
    /// Get the client-visible HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            SpoolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway: anything that went wrong on the upstream path,
            // including timeouts (clients apply their own retry policy)
            SpoolError::UpstreamConnectFailed(_)
            | SpoolError::UpstreamRequestFailed(_)
            | SpoolError::TunnelError(_)
            | SpoolError::Timeout => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            SpoolError::NoUpstreamsAvailable => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            SpoolError::InvalidConfig(_)
            | SpoolError::Io(_)
            | SpoolError::Http(_)
            | SpoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for SpoolError {
    fn from(err: hyper::Error) -> Self {
        SpoolError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            SpoolError::NoUpstreamsAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SpoolError::UpstreamConnectFailed("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(SpoolError::Timeout.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            SpoolError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SpoolError::InvalidConfig("bad".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SpoolError::TunnelError("reset".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
