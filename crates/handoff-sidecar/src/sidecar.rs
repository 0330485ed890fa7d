//! Top-level orchestration.
//!
//! Startup order is fixed: register with the host, bind the ingress, then
//! enter the event loop. No submission is forwarded before registration has
//! completed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use handoff_core::ShutdownReason;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SidecarConfig;
use crate::context::SidecarContext;
use crate::error::SidecarResult;
use crate::forwarder::Forwarder;
use crate::host::HostLifecycle;
use crate::lifecycle::LifecycleManager;
use crate::queue::QueueClient;
use crate::server::IngressServer;

/// A sidecar that has not started yet.
pub struct Sidecar<H, Q> {
    config: SidecarConfig,
    host: H,
    queue: Q,
    context: Arc<SidecarContext>,
    metrics: Option<PrometheusHandle>,
}

impl<H: HostLifecycle, Q: QueueClient> Sidecar<H, Q> {
    /// Create a sidecar from validated configuration.
    pub fn new(config: SidecarConfig, host: H, queue: Q) -> Self {
        Self {
            config,
            host,
            queue,
            context: Arc::new(SidecarContext::new()),
            metrics: None,
        }
    }

    /// Serve Prometheus metrics at `/_handoff/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    /// The shared context.
    pub fn context(&self) -> Arc<SidecarContext> {
        Arc::clone(&self.context)
    }

    /// Register with the host and start the ingress server.
    ///
    /// # Errors
    ///
    /// Fails if registration fails or the ingress address cannot be bound.
    pub async fn start(self) -> SidecarResult<RunningSidecar<H>> {
        let lifecycle = LifecycleManager::new(self.host, &self.config, Arc::clone(&self.context));
        let extension_id = lifecycle.register().await?;

        let forwarder = Arc::new(Forwarder::new(
            self.queue,
            &self.config,
            Arc::clone(&self.context),
        ));

        let server =
            match IngressServer::bind(&self.config, forwarder, Arc::clone(&self.context)).await {
                Ok(server) => server.with_metrics(self.metrics),
                Err(e) => {
                    error!(error = %e, "failed to start ingress");
                    self.context.begin_draining();
                    return Err(e);
                }
            };
        let local_addr = server.local_addr();
        let server_task = tokio::spawn(server.run());

        Ok(RunningSidecar {
            lifecycle,
            extension_id,
            local_addr,
            server_task,
        })
    }

    /// Start and run until the host announces shutdown or `stop` completes.
    ///
    /// # Errors
    ///
    /// Fails on startup errors and on a fatal lifecycle error.
    pub async fn run(self, stop: impl Future<Output = ()>) -> SidecarResult<ShutdownReason> {
        self.start().await?.run_until(stop).await
    }
}

/// A registered sidecar with its ingress server running.
pub struct RunningSidecar<H> {
    lifecycle: LifecycleManager<H>,
    extension_id: String,
    local_addr: SocketAddr,
    server_task: JoinHandle<()>,
}

impl<H: HostLifecycle> RunningSidecar<H> {
    /// Address the ingress server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identifier obtained at registration.
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// The shared context.
    pub fn context(&self) -> Arc<SidecarContext> {
        Arc::clone(self.lifecycle.context())
    }

    /// Run the event loop, then drain.
    ///
    /// Drain happens on every exit path, fatal errors included, so accepted
    /// forwards get their grace period before the process exits.
    pub async fn run_until(self, stop: impl Future<Output = ()>) -> SidecarResult<ShutdownReason> {
        let result = tokio::select! {
            result = self.lifecycle.run_events(&self.extension_id) => result,
            () = stop => {
                info!("stop requested outside the host lifecycle");
                Ok(ShutdownReason::Other("signal".to_string()))
            }
        };

        self.lifecycle.drain().await;

        if let Err(e) = self.server_task.await {
            warn!(error = %e, "ingress task ended abnormally");
        }

        match &result {
            Ok(reason) => info!(reason = %reason, "sidecar stopped"),
            Err(e) => error!(error = %e, "sidecar stopped on fatal error"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use handoff_core::LifecycleEvent;

    use crate::context::Phase;
    use crate::error::SidecarError;
    use crate::host::ScriptedHost;
    use crate::queue::MemoryQueue;

    fn config() -> SidecarConfig {
        SidecarConfig::builder()
            .queue_endpoint("http://queue.test")
            .listen_port(0)
            .drain_grace(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_registration_failure_never_binds() {
        let host = ScriptedHost::new("ext-1").failing_registration("denied");
        let sidecar = Sidecar::new(config(), host.clone(), MemoryQueue::new());
        let context = sidecar.context();

        let err = sidecar.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, SidecarError::LifecycleFatal { .. }));
        assert_eq!(context.phase(), Phase::Starting);
        assert_eq!(host.next_event_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_registers_before_serving() {
        let host = ScriptedHost::new("ext-9");
        let sidecar = Sidecar::new(config(), host.clone(), MemoryQueue::new());

        let running = sidecar.start().await.unwrap();
        assert_eq!(running.extension_id(), "ext-9");
        assert_eq!(running.context().phase(), Phase::Registered);
        assert_ne!(running.local_addr().port(), 0);

        host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
        let reason = running.run_until(std::future::pending()).await.unwrap();
        assert_eq!(reason, ShutdownReason::Spindown);
    }

    #[tokio::test]
    async fn test_stop_future_drains() {
        let sidecar = Sidecar::new(config(), ScriptedHost::new("ext-1"), MemoryQueue::new());
        let context = sidecar.context();

        let reason = sidecar.run(async {}).await.unwrap();
        assert_eq!(reason, ShutdownReason::Other("signal".to_string()));
        assert_eq!(context.phase(), Phase::Draining);
    }
}
