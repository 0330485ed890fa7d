//! Handoff worker middleware
//!
//! Wraps a worker's business handler so that every outcome, success or
//! failure, is handed to the local handoff sidecar and confirmed durable
//! before the invocation returns to the host.
//!
//! # Example
//!
//! ```rust,ignore
//! use bytes::Bytes;
//! use handoff_worker::{Handoff, InvocationContext};
//!
//! async fn handle(event: Bytes, ctx: &InvocationContext) -> Result<Bytes, String> {
//!     Ok(Bytes::from(format!("processed {}", ctx.request_id())))
//! }
//!
//! let handoff = Handoff::from_env()?;
//! let ctx = InvocationContext::from_deadline_ms("req-1", deadline_ms);
//! let value = handoff.invoke(event, &ctx, handle).await?;
//! ```

#![doc(html_root_url = "https://docs.rs/handoff-worker/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod sink;

pub use config::HandoffConfig;
pub use context::InvocationContext;
pub use error::{ForwardingError, InvocationError};
pub use middleware::{Handoff, InvocationState, Settled, Settlement};
pub use sink::{IngressClient, OutcomeSink, RecordingSink};
