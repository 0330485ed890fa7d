//! Process-wide sidecar state.
//!
//! Everything the lifecycle manager, the ingress server and the forwarder
//! share lives in one [`SidecarContext`] handed to each at construction, so
//! several isolated sidecars can coexist in one test process.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::shutdown::{InFlightTracker, ShutdownSignal};

/// Where the sidecar is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not registered with the host yet.
    Starting,
    /// Registered; submissions are accepted.
    Registered,
    /// Shutdown received; no new submissions are accepted.
    Draining,
}

impl Phase {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Registered => 1,
            Self::Draining => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Registered,
            _ => Self::Draining,
        }
    }
}

/// Shared sidecar state.
#[derive(Debug)]
pub struct SidecarContext {
    extension_id: RwLock<Option<String>>,
    phase: AtomicU8,
    deadline: RwLock<Option<Instant>>,
    in_flight: InFlightTracker,
    shutdown: ShutdownSignal,
    started: std::time::Instant,
}

impl SidecarContext {
    /// Create a context in the `Starting` phase.
    pub fn new() -> Self {
        Self {
            extension_id: RwLock::new(None),
            phase: AtomicU8::new(Phase::Starting.as_u8()),
            deadline: RwLock::new(None),
            in_flight: InFlightTracker::new(),
            shutdown: ShutdownSignal::new(),
            started: std::time::Instant::now(),
        }
    }

    /// Record the identifier returned by registration and start accepting work.
    pub fn mark_registered(&self, extension_id: impl Into<String>) {
        *self.extension_id.write() = Some(extension_id.into());
        // Never move back out of Draining.
        let _ = self.phase.compare_exchange(
            Phase::Starting.as_u8(),
            Phase::Registered.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Identifier obtained at registration.
    pub fn extension_id(&self) -> Option<String> {
        self.extension_id.read().clone()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether new submissions may be accepted.
    pub fn is_accepting(&self) -> bool {
        self.phase() == Phase::Registered
    }

    /// Enter the draining phase and notify the ingress server.
    pub fn begin_draining(&self) {
        self.phase.store(Phase::Draining.as_u8(), Ordering::SeqCst);
        self.shutdown.trigger();
    }

    /// Record the deadline of the current invocation, given in epoch milliseconds.
    pub fn record_deadline_ms(&self, deadline_ms: u64) {
        self.record_deadline(instant_from_epoch_ms(deadline_ms));
    }

    /// Record the deadline of the current invocation.
    pub fn record_deadline(&self, deadline: Instant) {
        *self.deadline.write() = Some(deadline);
    }

    /// Deadline of the most recent invocation, if one was announced.
    pub fn current_deadline(&self) -> Option<Instant> {
        *self.deadline.read()
    }

    /// Tracker for in-flight forwards.
    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }

    /// Signal fired when draining begins.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Time since the context was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for SidecarContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert an epoch-millisecond deadline into a monotonic instant.
///
/// Deadlines already in the past map to now.
pub fn instant_from_epoch_ms(deadline_ms: u64) -> Instant {
    Instant::now() + handoff_core::remaining_until_epoch_ms(deadline_ms)
}
