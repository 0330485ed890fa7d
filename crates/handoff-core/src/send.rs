//! Results of sending a payload to the durable queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Confirmation that the queue durably accepted a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Message identifier assigned by the queue, when it reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Ack {
    /// Create an ack carrying the queue's message id.
    pub fn with_message_id(id: impl Into<String>) -> Self {
        Self {
            message_id: Some(id.into()),
        }
    }
}

/// A failed send.
///
/// `retriable` errors are transient and may succeed when retried; the
/// others are definitive.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}")]
pub struct SendError {
    /// Human-readable reason.
    pub reason: String,
    /// Whether retrying the same payload may succeed.
    pub retriable: bool,
}

impl SendError {
    /// Create a transient error.
    pub fn retriable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: true,
        }
    }

    /// Create a definitive error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retriable: false,
        }
    }
}

/// Result of forwarding one payload.
pub type ForwardResult = Result<Ack, SendError>;
