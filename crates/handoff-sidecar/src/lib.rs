//! Handoff sidecar - durable outcome forwarding for short-lived workers
//!
//! The sidecar runs next to a worker inside a host-managed execution
//! environment. The worker hands each outcome to the sidecar over a loopback
//! HTTP call and blocks until the sidecar confirms the outcome is durable in a
//! queue. Independently, the sidecar follows the host lifecycle so it can stop
//! taking work and drain before the environment is torn down.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────── execution environment ─────────────────────────────┐
//! │                                                                                  │
//! │  ┌──────────────┐  POST /   ┌──────────────────────────────────────────────┐    │
//! │  │    Worker    │ ────────► │               handoff-sidecar                │    │
//! │  │  (Handoff    │           │                                              │    │
//! │  │  middleware) │ ◄──────── │  IngressServer ──► Forwarder ──► QueueClient ├────┼──► queue
//! │  └──────────────┘  200/5xx  │                                              │    │
//! │                             │  LifecycleManager ◄──── next_event ──────────┼────┼─── host
//! │                             └──────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```bash
//! # Run the sidecar with a configuration file
//! $ handoff-sidecar --config /opt/handoff/sidecar.toml
//!
//! # Run with environment variables only
//! $ DESTINATION_QUEUE_URL=https://sqs.us-east-1.amazonaws.com/123456789012/outcomes handoff-sidecar
//! ```

#![doc(html_root_url = "https://docs.rs/handoff-sidecar/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod sidecar;
pub mod sqs;

pub use config::{QueueKind, SidecarConfig, SidecarConfigBuilder};
pub use context::{Phase, SidecarContext};
pub use error::{ErrorResponse, SidecarError, SidecarResult};
pub use forwarder::{Forwarder, RetryPolicy};
pub use health::HealthStatus;
pub use host::{ExtensionsApiHost, HostLifecycle, ScriptedHost};
pub use lifecycle::LifecycleManager;
pub use queue::{HttpQueueClient, MemoryQueue, QueueBackend, QueueClient};
pub use server::IngressServer;
pub use shutdown::{InFlightTracker, ShutdownSignal};
pub use sidecar::{RunningSidecar, Sidecar};
pub use sqs::SqsQueueClient;

/// Sidecar version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
