//! Shutdown coordination and in-flight forward tracking.
//!
//! [`ShutdownSignal`] tells the ingress server to stop taking work;
//! [`InFlightTracker`] lets the lifecycle manager wait for accepted
//! forwards to finish before the process exits.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

/// A signal that can be used to trigger and await shutdown.
///
/// Clones share state: triggering any clone notifies all of them.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    /// Whether shutdown has been triggered
    triggered: Arc<AtomicBool>,

    /// Broadcast sender for notifying waiters
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    /// Creates a new shutdown signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            sender,
        }
    }

    /// Triggers the shutdown signal. Idempotent.
    pub fn trigger(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Ignore error if no receivers
            let _ = self.sender.send(());
        }
    }

    /// Returns `true` if shutdown has been triggered.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Returns a future that completes when shutdown is triggered.
    ///
    /// Completes immediately if shutdown was already triggered.
    pub fn recv(&self) -> ShutdownReceiver {
        // Subscribe before checking the flag so a trigger in between is seen.
        let mut receiver = self.sender.subscribe();
        let triggered = Arc::clone(&self.triggered);
        ShutdownReceiver {
            inner: Box::pin(async move {
                if triggered.load(Ordering::SeqCst) {
                    return;
                }
                // A closed channel also means no trigger can arrive.
                let _ = receiver.recv().await;
            }),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A future that completes when the shutdown signal is triggered.
///
/// Created by [`ShutdownSignal::recv()`].
pub struct ShutdownReceiver {
    inner: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl std::fmt::Debug for ShutdownReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownReceiver").finish_non_exhaustive()
    }
}

impl Future for ShutdownReceiver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// Waits for SIGTERM or SIGINT.
///
/// The host normally announces shutdown through its event API; a signal is
/// the fallback when it does not.
pub async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Failed to register signal handlers: {}", e);
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to wait for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C");
    }
}

/// Counts forwards that are currently being attempted.
///
/// Each forward holds an [`InFlightGuard`]; dropping the guard decrements
/// the count, so early returns and panics are accounted for.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl InFlightTracker {
    /// Creates a new tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one in-flight forward.
    #[must_use]
    pub fn acquire(&self) -> InFlightGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        crate::metrics::set_in_flight(self.in_flight());
        InFlightGuard {
            active: Arc::clone(&self.active),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Returns the number of in-flight forwards.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until no forward is in flight.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent drop cannot be missed.
            let notified = self.notify.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits until idle or until `grace` elapses.
    ///
    /// Returns `true` if every in-flight forward finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.wait_idle()).await.is_ok()
    }
}

/// A token representing one in-flight forward.
#[derive(Debug)]
pub struct InFlightGuard {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::set_in_flight(prev - 1);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}
