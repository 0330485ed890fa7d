//! Error types for the worker middleware.

use thiserror::Error;

/// Why an outcome could not be handed to the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardingError {
    /// The sidecar answered with a non-200 status.
    #[error("sidecar rejected the outcome ({status}): {message}")]
    Rejected {
        /// HTTP status returned by the sidecar.
        status: u16,
        /// Reason given by the sidecar.
        message: String,
        /// Whether the sidecar considered the failure transient.
        retriable: bool,
    },

    /// The sidecar could not be reached, or the connection failed mid-call.
    #[error("sidecar unreachable: {0}")]
    Transport(String),

    /// The forward request could not be encoded.
    #[error("failed to encode forward request: {0}")]
    Encode(String),
}

/// Error returned to the host for one invocation.
///
/// `Business` carries the handler's own failure message unchanged;
/// `Forwarding` means the handler finished but its outcome could not be
/// recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// The business function failed.
    #[error("{0}")]
    Business(String),

    /// The outcome could not be made durable.
    #[error("Failure: outcome could not be recorded: {0}")]
    Forwarding(#[source] ForwardingError),
}

impl InvocationError {
    /// Returns `true` for a business failure.
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Business(_))
    }

    /// Returns `true` for a forwarding failure.
    pub fn is_forwarding(&self) -> bool {
        matches!(self, Self::Forwarding(_))
    }
}

impl From<ForwardingError> for InvocationError {
    fn from(err: ForwardingError) -> Self {
        Self::Forwarding(err)
    }
}
