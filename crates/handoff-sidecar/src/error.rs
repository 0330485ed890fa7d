//! Error types for the handoff sidecar.

use std::fmt;

use handoff_core::SendError;
use thiserror::Error;

/// Sidecar-specific errors.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// Registration or repeated event fetch failure. The process must exit.
    #[error("Lifecycle fatal: {message}")]
    LifecycleFatal {
        /// Error message.
        message: String,
    },

    /// A single host API call failed.
    #[error("Host API error: {message}")]
    Host {
        /// Error message.
        message: String,
        /// Optional HTTP status code from the host.
        status: Option<u16>,
    },

    /// Submission body could not be accepted.
    #[error("Invalid submission: {message}")]
    InvalidSubmission {
        /// Error message.
        message: String,
    },

    /// Submission exceeds the payload limit.
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The sidecar is draining or not yet registered and takes no new work.
    #[error("Not accepting submissions: {message}")]
    NotAccepting {
        /// Error message.
        message: String,
    },

    /// Forwarding to the queue failed definitively.
    #[error("Forwarding failed: {0}")]
    Forward(#[from] SendError),

    /// Server startup error.
    #[error("Server error: {message}")]
    Server {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request client error.
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl SidecarError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a fatal lifecycle error.
    pub fn lifecycle_fatal(message: impl Into<String>) -> Self {
        Self::LifecycleFatal {
            message: message.into(),
        }
    }

    /// Create a host API error.
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host {
            message: message.into(),
            status: None,
        }
    }

    /// Create a host API error with status code.
    pub fn host_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Host {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create an invalid submission error.
    pub fn invalid_submission(message: impl Into<String>) -> Self {
        Self::InvalidSubmission {
            message: message.into(),
        }
    }

    /// Create a not-accepting error.
    pub fn not_accepting(message: impl Into<String>) -> Self {
        Self::NotAccepting {
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error.
    #[allow(clippy::match_same_arms)]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config { .. } => 500,
            Self::LifecycleFatal { .. } => 500,
            Self::Host { status, .. } => status.unwrap_or(502),
            Self::InvalidSubmission { .. } => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::NotAccepting { .. } => 503,
            Self::Forward(_) => 502,
            Self::Server { .. } => 500,
            Self::Io(_) => 500,
            Self::Json(_) => 400,
            Self::Request(_) => 502,
        }
    }

    /// Check if this error is recoverable by retrying the same call.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Host { .. } | Self::Request(_) | Self::Io(_) => true,
            Self::Forward(e) => e.retriable,
            _ => false,
        }
    }

    /// Get the error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::LifecycleFatal { .. } => "lifecycle",
            Self::Host { .. } => "host",
            Self::InvalidSubmission { .. } => "invalid_submission",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NotAccepting { .. } => "not_accepting",
            Self::Forward(_) => "forward",
            Self::Server { .. } => "server",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Request(_) => "request",
        }
    }
}

/// Result type for sidecar operations.
pub type SidecarResult<T> = Result<T, SidecarError>;

/// Error body returned by the ingress endpoint on non-200 answers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    /// Error category.
    pub error: String,
    /// Human-readable reason.
    pub message: String,
    /// Whether resubmitting may succeed.
    pub retriable: bool,
    /// Request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            retriable: false,
            request_id: None,
        }
    }

    /// Set the request ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Mark the error as retriable.
    #[must_use]
    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }
}

impl From<&SidecarError> for ErrorResponse {
    fn from(err: &SidecarError) -> Self {
        Self::new(err.category(), err.to_string()).with_retriable(err.is_recoverable())
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = SidecarError::config("missing field");
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.category(), "config");

        let err = SidecarError::host("connection refused");
        assert_eq!(err.status_code(), 502);

        let err = SidecarError::host_with_status("bad response", 403);
        assert_eq!(err.status_code(), 403);

        let err = SidecarError::invalid_submission("empty body");
        assert_eq!(err.status_code(), 400);

        let err = SidecarError::PayloadTooLarge { size: 10, limit: 5 };
        assert_eq!(err.status_code(), 413);

        let err = SidecarError::not_accepting("draining");
        assert_eq!(err.status_code(), 503);

        let err = SidecarError::from(SendError::fatal("no such queue"));
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.category(), "forward");
    }

    #[test]
    fn test_error_display() {
        let err = SidecarError::lifecycle_fatal("register failed");
        assert!(err.to_string().contains("Lifecycle fatal"));

        let err = SidecarError::not_accepting("draining");
        assert!(err.to_string().contains("draining"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(SidecarError::host("test").is_recoverable());
        assert!(SidecarError::from(SendError::retriable("throttled")).is_recoverable());
        assert!(!SidecarError::from(SendError::fatal("gone")).is_recoverable());
        assert!(!SidecarError::not_accepting("draining").is_recoverable());
        assert!(!SidecarError::lifecycle_fatal("test").is_recoverable());
    }

    #[test]
    fn test_error_response() {
        let resp = ErrorResponse::new("forward", "queue unavailable")
            .with_request_id("req-123")
            .with_retriable(true);

        assert_eq!(resp.error, "forward");
        assert_eq!(resp.request_id, Some("req-123".to_string()));
        assert!(resp.retriable);
        assert_eq!(resp.to_string(), "[forward] queue unavailable");

        let err = SidecarError::not_accepting("draining");
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.error, "not_accepting");
        assert!(!resp.retriable);
    }
}
