//! Error types for the handler egress client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the handler
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Handler returned an error status code
    #[error("handler error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the handler
        message: String,
    },

    /// Failed to parse a handler response
    #[error("failed to parse response: {0}")]
    ParseError(String),

    /// Operation requires a connected transport
    #[error("not connected to handler")]
    NotConnected,

    /// A log stream is already open for this worker
    #[error("log stream already exists for worker {0}")]
    StreamAlreadyOpen(String),

    /// No log stream is open for this worker
    #[error("no active stream for worker {0}")]
    NoActiveStream(String),

    /// The stream was closed or exceeded its deadline
    #[error("log stream closed for worker {0}")]
    StreamClosed(String),

    /// Handler asked for the entry to be re-sent
    #[error("handler requested retry: {0}")]
    RetryRequested(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 500)
    }
}
