//! Registration and event loop with the host.

use std::sync::Arc;
use std::time::Duration;

use handoff_core::{LifecycleEvent, ShutdownReason};
use tracing::{debug, error, info, warn};

use crate::config::{LifecycleSettings, SidecarConfig};
use crate::context::SidecarContext;
use crate::error::{SidecarError, SidecarResult};
use crate::host::HostLifecycle;

/// Drives the sidecar through its host lifecycle.
///
/// `register` runs once at start. `run_events` then polls the host until it
/// announces shutdown, recording each invocation deadline in the context.
/// `drain` stops ingress and waits for in-flight forwards.
#[derive(Debug)]
pub struct LifecycleManager<H> {
    host: H,
    context: Arc<SidecarContext>,
    settings: LifecycleSettings,
}

impl<H: HostLifecycle> LifecycleManager<H> {
    /// Create a lifecycle manager.
    pub fn new(host: H, config: &SidecarConfig, context: Arc<SidecarContext>) -> Self {
        Self {
            host,
            context,
            settings: config.lifecycle.clone(),
        }
    }

    /// Register with the host. Failure is fatal.
    pub async fn register(&self) -> SidecarResult<String> {
        match self.host.register().await {
            Ok(id) => {
                info!(extension_id = %id, "registered with host");
                self.context.mark_registered(id.clone());
                Ok(id)
            }
            Err(e) => {
                error!(error = %e, "registration failed");
                Err(SidecarError::lifecycle_fatal(format!(
                    "registration failed: {e}"
                )))
            }
        }
    }

    /// Poll the host until it announces shutdown.
    ///
    /// Consecutive fetch failures are retried with exponential backoff; one
    /// more than `event_retry_ceiling` is fatal.
    pub async fn run_events(&self, id: &str) -> SidecarResult<ShutdownReason> {
        let mut failures: u32 = 0;

        loop {
            match self.host.next_event(id).await {
                Ok(LifecycleEvent::Invoke {
                    deadline_ms,
                    request_id,
                }) => {
                    failures = 0;
                    debug!(request_id = %request_id, deadline_ms, "invocation started");
                    self.context.record_deadline_ms(deadline_ms);
                }
                Ok(LifecycleEvent::Shutdown {
                    shutdown_reason, ..
                }) => {
                    info!(reason = %shutdown_reason, "shutdown announced by host");
                    return Ok(shutdown_reason);
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.settings.event_retry_ceiling {
                        error!(failures, error = %e, "giving up on event fetch");
                        return Err(SidecarError::lifecycle_fatal(format!(
                            "event fetch failed {failures} times in a row: {e}"
                        )));
                    }

                    let delay = self.retry_delay(failures);
                    warn!(
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "event fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Stop accepting ingress and wait up to the grace timeout for in-flight
    /// forwards. Returns `true` if everything drained.
    pub async fn drain(&self) -> bool {
        self.context.begin_draining();

        let in_flight = self.context.in_flight().in_flight();
        info!(
            in_flight,
            grace_ms = self.settings.drain_grace.as_millis() as u64,
            "draining in-flight forwards"
        );

        let drained = self
            .context
            .in_flight()
            .drain(self.settings.drain_grace)
            .await;
        if drained {
            info!("all forwards drained");
        } else {
            warn!(
                remaining = self.context.in_flight().in_flight(),
                "drain grace expired with forwards still in flight"
            );
        }
        drained
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<SidecarContext> {
        &self.context
    }

    fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(10);
        self.settings
            .event_retry_base
            .saturating_mul(2u32.saturating_pow(exponent))
    }
}
