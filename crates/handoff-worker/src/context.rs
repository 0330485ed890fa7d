//! Per-invocation context.

use std::time::Duration;

use tokio::time::Instant;

/// What the middleware knows about the invocation it is running in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    request_id: String,
    deadline: Instant,
}

impl InvocationContext {
    /// Create a context with an absolute deadline.
    pub fn new(request_id: impl Into<String>, deadline: Instant) -> Self {
        Self {
            request_id: request_id.into(),
            deadline,
        }
    }

    /// Create a context from an epoch-millisecond deadline, as hosts report it.
    pub fn from_deadline_ms(request_id: impl Into<String>, deadline_ms: u64) -> Self {
        Self::with_remaining(request_id, handoff_core::remaining_until_epoch_ms(deadline_ms))
    }

    /// Create a context whose deadline is `remaining` from now.
    pub fn with_remaining(request_id: impl Into<String>, remaining: Duration) -> Self {
        Self::new(request_id, Instant::now() + remaining)
    }

    /// Host request identifier.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed.
    ///
    /// Recomputed on every call.
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
