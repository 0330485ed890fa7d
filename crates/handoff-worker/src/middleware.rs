//! The handoff middleware.
//!
//! [`Handoff::invoke`] runs the business handler, captures what it produced
//! as an [`Outcome`], and hands that outcome to the sidecar before returning
//! to the host. The submission is awaited: the host may freeze the process
//! as soon as the invocation returns, so a detached send could be lost.
//!
//! One invocation moves through
//! `Running -> Outcomed -> {Skipped | Forwarding} -> Settled`:
//!
//! - `Skipped` when less than the safety threshold remains. The outcome is
//!   returned unrecorded so the worker still finishes within its deadline.
//! - `Forwarding` otherwise. A failed submission settles as
//!   [`Settled::ForwardingFailed`] whatever the business outcome was.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures_util::FutureExt;
use handoff_core::{ForwardRequest, Outcome};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::HandoffConfig;
use crate::context::InvocationContext;
use crate::error::{ForwardingError, InvocationError};
use crate::sink::{IngressClient, OutcomeSink};

/// Where an invocation is in the middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// The business handler is running.
    Running,
    /// The handler finished and its outcome was captured.
    Outcomed,
    /// Too little time was left; the outcome is not forwarded.
    Skipped,
    /// The outcome is being submitted to the sidecar.
    Forwarding,
    /// The invocation has a final result.
    Settled(Settled),
}

/// Terminal state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// The handler succeeded.
    Success,
    /// The handler failed.
    Failure,
    /// The outcome could not be recorded.
    ForwardingFailed,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Outcomed => f.write_str("outcomed"),
            Self::Skipped => f.write_str("skipped"),
            Self::Forwarding => f.write_str("forwarding"),
            Self::Settled(Settled::Success) => f.write_str("settled-success"),
            Self::Settled(Settled::Failure) => f.write_str("settled-failure"),
            Self::Settled(Settled::ForwardingFailed) => f.write_str("settled-forwarding-failed"),
        }
    }
}

/// Full record of one invocation.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// What the handler produced.
    pub outcome: Outcome,
    /// States visited, in order.
    pub states: Vec<InvocationState>,
    /// Result handed back to the host.
    pub result: Result<Bytes, InvocationError>,
}

impl Settlement {
    /// Terminal state.
    pub fn settled(&self) -> Option<Settled> {
        match self.states.last() {
            Some(InvocationState::Settled(settled)) => Some(*settled),
            _ => None,
        }
    }

    /// Whether the outcome was submitted to the sink.
    pub fn was_forwarded(&self) -> bool {
        self.states.contains(&InvocationState::Forwarding)
    }
}

/// Wraps business handlers so every outcome is recorded before returning.
#[derive(Debug, Clone)]
pub struct Handoff<S> {
    sink: S,
    config: HandoffConfig,
}

impl Handoff<IngressClient> {
    /// Middleware posting to the sidecar, configured from the environment.
    pub fn from_env() -> Result<Self, ForwardingError> {
        let config = HandoffConfig::from_env();
        let sink = IngressClient::new(&config)?;
        Ok(Self::new(sink, config))
    }
}

impl<S: OutcomeSink> Handoff<S> {
    /// Create a middleware handing outcomes to `sink`.
    pub fn new(sink: S, config: HandoffConfig) -> Self {
        Self { sink, config }
    }

    /// The sink outcomes are handed to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The configuration in use.
    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Run `handler` on `event` and return its result to the host.
    ///
    /// A business failure comes back as [`InvocationError::Business`] with the
    /// handler's message. A failed submission comes back as
    /// [`InvocationError::Forwarding`].
    pub async fn invoke<'a, F, Fut, E>(
        &self,
        event: Bytes,
        ctx: &'a InvocationContext,
        handler: F,
    ) -> Result<Bytes, InvocationError>
    where
        F: FnOnce(Bytes, &'a InvocationContext) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: fmt::Display,
    {
        self.run(event, ctx, handler).await.result
    }

    /// Like [`invoke`](Self::invoke), returning the full settlement record.
    pub async fn run<'a, F, Fut, E>(
        &self,
        event: Bytes,
        ctx: &'a InvocationContext,
        handler: F,
    ) -> Settlement
    where
        F: FnOnce(Bytes, &'a InvocationContext) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let span = info_span!("invocation", request_id = %ctx.request_id());
        self.settle(event, ctx, handler).instrument(span).await
    }

    async fn settle<'a, F, Fut, E>(
        &self,
        event: Bytes,
        ctx: &'a InvocationContext,
        handler: F,
    ) -> Settlement
    where
        F: FnOnce(Bytes, &'a InvocationContext) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let mut states = vec![InvocationState::Running];

        let outcome = capture(handler, event.clone(), ctx).await;
        enter(&mut states, InvocationState::Outcomed);
        debug!(outcome = outcome.kind(), "handler finished");

        let remaining = ctx.remaining_time();
        if remaining < self.config.safety_threshold {
            enter(&mut states, InvocationState::Skipped);
            warn!(
                remaining_ms = remaining.as_millis() as u64,
                "not enough time left, outcome not forwarded"
            );
            return finish(outcome, states);
        }

        enter(&mut states, InvocationState::Forwarding);
        let request = ForwardRequest::new(event, outcome.clone());
        if let Err(e) = self.sink.submit(&request).await {
            warn!(error = %e, "outcome could not be recorded");
            enter(&mut states, InvocationState::Settled(Settled::ForwardingFailed));
            return Settlement {
                outcome,
                states,
                result: Err(InvocationError::Forwarding(e)),
            };
        }

        finish(outcome, states)
    }
}

/// Run the handler, turning an error or a panic into a failure outcome.
async fn capture<'a, F, Fut, E>(handler: F, event: Bytes, ctx: &'a InvocationContext) -> Outcome
where
    F: FnOnce(Bytes, &'a InvocationContext) -> Fut,
    Fut: Future<Output = Result<Bytes, E>>,
    E: fmt::Display,
{
    let run = AssertUnwindSafe(async move { handler(event, ctx).await }).catch_unwind();

    match run.await {
        Ok(result) => Outcome::from(result),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Outcome::failure(message)
        }
    }
}

fn enter(states: &mut Vec<InvocationState>, next: InvocationState) {
    debug!(state = %next, "invocation state");
    states.push(next);
}

fn finish(outcome: Outcome, mut states: Vec<InvocationState>) -> Settlement {
    let (settled, result) = match outcome.clone().into_result() {
        Ok(value) => (Settled::Success, Ok(value)),
        Err(message) => (Settled::Failure, Err(InvocationError::Business(message))),
    };
    enter(&mut states, InvocationState::Settled(settled));

    Settlement {
        outcome,
        states,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use handoff_core::SAFETY_THRESHOLD_MS;
    use proptest::prelude::*;

    use crate::sink::RecordingSink;

    fn handoff(sink: RecordingSink) -> Handoff<RecordingSink> {
        Handoff::new(sink, HandoffConfig::default())
    }

    fn ctx(remaining_ms: u64) -> InvocationContext {
        InvocationContext::with_remaining("req-1", Duration::from_millis(remaining_ms))
    }

    async fn succeed(value: &'static str) -> Result<Bytes, String> {
        Ok(Bytes::from_static(value.as_bytes()))
    }

    async fn fail(message: &'static str) -> Result<Bytes, String> {
        Err(message.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_forwarded_then_returned() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(5_000);

        let result = mw.invoke(Bytes::from_static(b"evt"), &ctx, |_, _| succeed("X")).await;

        assert_eq!(result.unwrap(), Bytes::from_static(b"X"));
        let sent = sink.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, Outcome::success("X"));
        assert_eq!(sent[0].original_event, Bytes::from_static(b"evt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_forwarded_then_reraised() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(5_000);

        let err = mw
            .invoke(Bytes::from_static(b"evt"), &ctx, |_, _| fail("Boom"))
            .await
            .unwrap_err();

        assert_eq!(err, InvocationError::Business("Boom".to_string()));
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.submitted()[0].outcome, Outcome::failure("Boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_time_skips_forwarding() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(500);

        let settlement = mw.run(Bytes::from_static(b"evt"), &ctx, |_, _| succeed("X")).await;

        assert_eq!(settlement.result.unwrap(), Bytes::from_static(b"X"));
        assert_eq!(sink.count(), 0);
        assert_eq!(
            settlement.states,
            vec![
                InvocationState::Running,
                InvocationState::Outcomed,
                InvocationState::Skipped,
                InvocationState::Settled(Settled::Success),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_time_reraises_failure_unrecorded() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(999);

        let err = mw
            .invoke(Bytes::from_static(b"evt"), &ctx, |_, _| fail("Boom"))
            .await
            .unwrap_err();

        assert_eq!(err, InvocationError::Business("Boom".to_string()));
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_threshold_still_forwards() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(SAFETY_THRESHOLD_MS);

        let settlement = mw.run(Bytes::from_static(b"evt"), &ctx, |_, _| succeed("X")).await;
        assert!(settlement.was_forwarded());
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_time_counts_against_budget() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(2_000);

        let settlement = mw
            .run(Bytes::from_static(b"evt"), &ctx, |_, _| async {
                tokio::time::sleep(Duration::from_millis(1_500)).await;
                Ok::<_, String>(Bytes::from_static(b"late"))
            })
            .await;

        assert!(!settlement.was_forwarded());
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_forward_raises_forwarding_failure() {
        let sink = RecordingSink::failing(ForwardingError::Rejected {
            status: 502,
            message: "queue rejected payload".into(),
            retriable: false,
        });
        let mw = handoff(sink.clone());
        let ctx = ctx(5_000);

        let settlement = mw.run(Bytes::from_static(b"evt"), &ctx, |_, _| succeed("X")).await;

        assert!(settlement.result.as_ref().unwrap_err().is_forwarding());
        assert_eq!(settlement.settled(), Some(Settled::ForwardingFailed));
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarding_failure_overrides_business_failure() {
        let sink = RecordingSink::failing(ForwardingError::Transport("refused".into()));
        let mw = handoff(sink.clone());
        let ctx = ctx(5_000);

        let err = mw
            .invoke(Bytes::from_static(b"evt"), &ctx, |_, _| fail("Boom"))
            .await
            .unwrap_err();

        assert!(err.is_forwarding());
        assert_eq!(sink.submitted()[0].outcome, Outcome::failure("Boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_captured_as_failure() {
        let sink = RecordingSink::new();
        let mw = handoff(sink.clone());
        let ctx = ctx(5_000);

        let err = mw
            .invoke(Bytes::from_static(b"evt"), &ctx, |_, _| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<_, String>(Bytes::new())
            })
            .await
            .unwrap_err();

        assert_eq!(err, InvocationError::Business("handler exploded".to_string()));
        assert_eq!(sink.submitted()[0].outcome, Outcome::failure("handler exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_sees_event_and_context() {
        let sink = RecordingSink::new();
        let mw = handoff(sink);
        let ctx = ctx(5_000);

        let result = mw
            .invoke(Bytes::from_static(b"ping"), &ctx, |event, ctx| async move {
                Ok::<_, String>(Bytes::from(format!(
                    "{}:{}",
                    String::from_utf8_lossy(&event),
                    ctx.request_id()
                )))
            })
            .await;

        assert_eq!(result.unwrap(), Bytes::from_static(b"ping:req-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_on_forward_path() {
        let mw = handoff(RecordingSink::new());
        let ctx = ctx(5_000);

        let settlement = mw.run(Bytes::from_static(b"evt"), &ctx, |_, _| fail("no")).await;
        assert_eq!(
            settlement.states,
            vec![
                InvocationState::Running,
                InvocationState::Outcomed,
                InvocationState::Forwarding,
                InvocationState::Settled(Settled::Failure),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_enough_time_forwards_exactly_once(remaining_ms in 1_100u64..60_000, ok in any::<bool>()) {
            let sink = RecordingSink::new();
            let mw = handoff(sink.clone());
            let ctx = ctx(remaining_ms);

            let settlement = tokio_test::block_on(mw.run(Bytes::from_static(b"evt"), &ctx, |_, _| async move {
                if ok { Ok(Bytes::from_static(b"v")) } else { Err("bad".to_string()) }
            }));

            prop_assert_eq!(sink.count(), 1);
            prop_assert_eq!(&sink.submitted()[0].outcome, &settlement.outcome);
        }

        #[test]
        fn prop_low_time_never_forwards(remaining_ms in 0u64..900, ok in any::<bool>()) {
            let sink = RecordingSink::new();
            let mw = handoff(sink.clone());
            let ctx = ctx(remaining_ms);

            let settlement = tokio_test::block_on(mw.run(Bytes::from_static(b"evt"), &ctx, |_, _| async move {
                if ok { Ok(Bytes::from_static(b"v")) } else { Err("bad".to_string()) }
            }));

            prop_assert_eq!(sink.count(), 0);
            prop_assert_eq!(settlement.result.is_ok(), ok);
        }
    }
}
