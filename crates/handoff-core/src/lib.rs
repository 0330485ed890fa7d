//! # Handoff Core
//!
//! Types shared by the handoff sidecar and the worker-side middleware.
//!
//! - [`Outcome`] - Result of one worker invocation
//! - [`ForwardRequest`] - Wire payload posted by the worker and sent to the queue
//! - [`Ack`] / [`SendError`] / [`ForwardResult`] - Queue send results
//! - [`LifecycleEvent`] - Events delivered by the host to the sidecar
//! - [`remaining_until_epoch_ms`] - Host deadline to remaining time

#![doc(html_root_url = "https://docs.rs/handoff-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod deadline;
pub mod event;
pub mod outcome;
pub mod send;

pub use deadline::remaining_until_epoch_ms;
pub use event::{LifecycleEvent, ShutdownReason};
pub use outcome::{ForwardRequest, Outcome};
pub use send::{Ack, ForwardResult, SendError};

/// Default loopback address of the sidecar ingress endpoint.
pub const DEFAULT_INGRESS_ADDR: &str = "127.0.0.1";

/// Default port of the sidecar ingress endpoint.
pub const DEFAULT_INGRESS_PORT: u16 = 8080;

/// Remaining time below which the worker skips forwarding altogether.
pub const SAFETY_THRESHOLD_MS: u64 = 1_000;
