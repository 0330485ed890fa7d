//! Forwarding of worker outcomes to the queue.
//!
//! [`Forwarder::forward`] validates and serializes a [`ForwardRequest`],
//! then sends it with exponential backoff on transient failures. Retries
//! stop once the next attempt would start inside the safety margin before
//! the invocation deadline: the host may freeze or kill the environment at
//! the deadline, so the last error is returned instead.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use handoff_core::{ForwardRequest, ForwardResult, SendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ForwardSettings, SidecarConfig};
use crate::context::SidecarContext;
use crate::metrics;
use crate::queue::QueueClient;
use crate::shutdown::InFlightGuard;

/// Backoff and deadline parameters for one forward.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied after each retry.
    pub factor: u32,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
    /// Optional cap on attempts, the first included.
    pub max_attempts: Option<u32>,
    /// No retry starts closer than this to the deadline.
    pub safety_margin: Duration,
    /// Lower bound on the time given to a single attempt.
    pub min_attempt_timeout: Duration,
    /// Budget used when no invocation deadline is known.
    pub fallback_budget: Duration,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    pub fn from_settings(settings: &ForwardSettings) -> Self {
        Self {
            base: settings.backoff_base,
            factor: settings.backoff_factor.max(1),
            max_delay: settings.backoff_max,
            max_attempts: settings.max_attempts.map(|n| n.max(1)),
            safety_margin: settings.safety_margin,
            min_attempt_timeout: settings.min_attempt_timeout,
            fallback_budget: settings.fallback_budget,
        }
    }

    /// Delay to wait after the `attempt`-th failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = self.factor.saturating_pow(exponent);
        self.base.saturating_mul(multiplier).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&ForwardSettings::default())
    }
}

/// Sends forward requests to the queue.
///
/// The forwarder exclusively owns the queue client.
#[derive(Debug)]
pub struct Forwarder<Q> {
    queue: Q,
    policy: RetryPolicy,
    max_payload_bytes: usize,
    context: Arc<SidecarContext>,
}

impl<Q: QueueClient> Forwarder<Q> {
    /// Create a forwarder from configuration.
    pub fn new(queue: Q, config: &SidecarConfig, context: Arc<SidecarContext>) -> Self {
        Self {
            queue,
            policy: RetryPolicy::from_settings(&config.forward),
            max_payload_bytes: config.ingress.max_payload_bytes,
            context,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deadline for a forward starting now: the current invocation's
    /// deadline, or the fallback budget when none was announced.
    pub fn current_deadline(&self) -> Instant {
        self.context
            .current_deadline()
            .unwrap_or_else(|| Instant::now() + self.policy.fallback_budget)
    }

    /// Forward one request, retrying transient failures until `deadline`
    /// minus the safety margin.
    pub async fn forward(&self, request: &ForwardRequest, deadline: Instant) -> ForwardResult {
        let guard = self.context.in_flight().acquire();
        self.forward_with_guard(request, deadline, guard).await
    }

    /// Forward one request under an in-flight guard the caller already holds.
    ///
    /// The guard is released when the forward finishes.
    pub async fn forward_with_guard(
        &self,
        request: &ForwardRequest,
        deadline: Instant,
        _guard: InFlightGuard,
    ) -> ForwardResult {
        let start = Instant::now();

        let result = match self.prepare(request) {
            Ok(payload) => self.send_with_retry(payload, deadline).await,
            Err(e) => Err(e),
        };

        let label = match &result {
            Ok(_) => "ack",
            Err(e) if e.retriable => "gave_up",
            Err(_) => "rejected",
        };
        metrics::record_forward(label, start.elapsed());

        result
    }

    /// Validate and serialize a request into the queue payload.
    pub fn prepare(&self, request: &ForwardRequest) -> Result<Bytes, SendError> {
        if request.original_event.is_empty() {
            return Err(SendError::fatal("original event is empty"));
        }

        let payload = request
            .to_payload()
            .map_err(|e| SendError::fatal(format!("failed to serialize payload: {e}")))?;

        if payload.len() > self.max_payload_bytes {
            return Err(SendError::fatal(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        Ok(payload)
    }

    async fn send_with_retry(&self, payload: Bytes, deadline: Instant) -> ForwardResult {
        let cutoff = deadline
            .checked_sub(self.policy.safety_margin)
            .unwrap_or(deadline);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(payload.clone(), deadline).await {
                Ok(ack) => {
                    debug!(attempt, message_id = ?ack.message_id, "payload acknowledged");
                    metrics::record_attempt("ack");
                    return Ok(ack);
                }
                Err(e) if !e.retriable => {
                    warn!(attempt, error = %e, "queue rejected payload");
                    metrics::record_attempt("fatal");
                    return Err(e);
                }
                Err(e) => e,
            };
            metrics::record_attempt("retriable");

            if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(attempt, error = %err, "giving up after max attempts");
                return Err(err);
            }

            let delay = self.policy.delay_after(attempt);
            if Instant::now() + delay >= cutoff {
                info!(
                    attempt,
                    error = %err,
                    "deadline margin reached, not retrying"
                );
                return Err(err);
            }

            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying send");
            tokio::time::sleep(delay).await;
        }
    }

    /// One send, bounded by the time left to the hard deadline.
    ///
    /// A send still in transit when the bound expires is abandoned and its
    /// result discarded.
    async fn attempt(&self, payload: Bytes, deadline: Instant) -> ForwardResult {
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .max(self.policy.min_attempt_timeout);

        match tokio::time::timeout(budget, self.queue.send(payload)).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_attempt("timeout");
                Err(SendError::retriable(
                    "deadline exceeded while sending, result discarded",
                ))
            }
        }
    }
}
