//! Lifecycle events delivered by the host to the sidecar.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Event returned by the host's blocking `next event` call.
///
/// The wire form is the host's tagged JSON, e.g.
/// `{"eventType":"INVOKE","deadlineMs":1700000000000,"requestId":"..."}`.
/// Fields the sidecar has no use for are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "UPPERCASE")]
pub enum LifecycleEvent {
    /// An invocation of the worker is about to start.
    #[serde(rename_all = "camelCase")]
    Invoke {
        /// Invocation deadline in milliseconds since the Unix epoch.
        deadline_ms: u64,
        /// Host-assigned invocation identifier.
        #[serde(default)]
        request_id: String,
    },
    /// The environment is shutting down.
    #[serde(rename_all = "camelCase")]
    Shutdown {
        /// Why the host is shutting down.
        shutdown_reason: ShutdownReason,
        /// Deadline for the sidecar to exit, in milliseconds since the Unix epoch.
        #[serde(default)]
        deadline_ms: u64,
    },
}

impl LifecycleEvent {
    /// Create an invoke event.
    pub fn invoke(deadline_ms: u64, request_id: impl Into<String>) -> Self {
        Self::Invoke {
            deadline_ms,
            request_id: request_id.into(),
        }
    }

    /// Create a shutdown event.
    pub fn shutdown(reason: ShutdownReason) -> Self {
        Self::Shutdown {
            shutdown_reason: reason,
            deadline_ms: 0,
        }
    }

    /// Check if this is a shutdown event.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}

/// Reason attached to a shutdown event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShutdownReason {
    /// The environment is being recycled normally.
    Spindown,
    /// The worker exceeded its deadline.
    Timeout,
    /// The worker or another sidecar failed.
    Failure,
    /// A reason this crate does not know about.
    Other(String),
}

impl ShutdownReason {
    /// Wire representation of the reason.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Spindown => "spindown",
            Self::Timeout => "timeout",
            Self::Failure => "failure",
            Self::Other(reason) => reason,
        }
    }
}

impl From<String> for ShutdownReason {
    fn from(reason: String) -> Self {
        match reason.to_ascii_lowercase().as_str() {
            "spindown" => Self::Spindown,
            "timeout" => Self::Timeout,
            "failure" => Self::Failure,
            _ => Self::Other(reason),
        }
    }
}

impl From<ShutdownReason> for String {
    fn from(reason: ShutdownReason) -> Self {
        reason.as_str().to_string()
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
