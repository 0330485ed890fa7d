//! Health report served at `/_handoff/health`.
//!
//! The report reflects the lifecycle phase: only a registered sidecar is
//! `healthy`. A starting or draining sidecar answers `503` so a local probe
//! can tell it will not take new submissions.

use serde::{Deserialize, Serialize};

use crate::context::{Phase, SidecarContext};

/// Health status response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    /// "healthy", "starting" or "draining"
    status: String,

    /// Lifecycle phase
    phase: Phase,

    /// Forwards currently being attempted
    in_flight: usize,

    /// Identifier obtained at registration
    #[serde(skip_serializing_if = "Option::is_none")]
    extension_id: Option<String>,

    /// Sidecar version
    version: String,

    /// Sidecar uptime in seconds
    uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot the health of a sidecar.
    #[must_use]
    pub fn from_context(context: &SidecarContext) -> Self {
        let phase = context.phase();
        let status = match phase {
            Phase::Starting => "starting",
            Phase::Registered => "healthy",
            Phase::Draining => "draining",
        };

        Self {
            status: status.to_string(),
            phase,
            in_flight: context.in_flight().in_flight(),
            extension_id: context.extension_id(),
            version: crate::VERSION.to_string(),
            uptime_seconds: context.uptime().as_secs(),
        }
    }

    /// Returns the status string.
    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Returns the lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the number of in-flight forwards.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Returns whether the sidecar accepts submissions.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.phase == Phase::Registered
    }

    /// HTTP status for this report.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        if self.is_healthy() {
            200
        } else {
            503
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_follows_phase() {
        let ctx = SidecarContext::new();
        let status = HealthStatus::from_context(&ctx);
        assert_eq!(status.status(), "starting");
        assert_eq!(status.status_code(), 503);

        ctx.mark_registered("ext-1");
        let status = HealthStatus::from_context(&ctx);
        assert!(status.is_healthy());
        assert_eq!(status.status_code(), 200);

        ctx.begin_draining();
        let status = HealthStatus::from_context(&ctx);
        assert_eq!(status.status(), "draining");
        assert_eq!(status.phase(), Phase::Draining);
        assert_eq!(status.status_code(), 503);
    }

    #[test]
    fn test_health_counts_in_flight() {
        let ctx = SidecarContext::new();
        let _guard = ctx.in_flight().acquire();
        assert_eq!(HealthStatus::from_context(&ctx).in_flight(), 1);
    }

    #[test]
    fn test_health_serialization() {
        let ctx = SidecarContext::new();
        ctx.mark_registered("ext-1");

        let json = serde_json::to_value(HealthStatus::from_context(&ctx)).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["phase"], "registered");
        assert_eq!(json["extension_id"], "ext-1");
        assert_eq!(json["in_flight"], 0);
    }
}
