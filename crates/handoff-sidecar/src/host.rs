//! The host lifecycle protocol.
//!
//! [`HostLifecycle`] abstracts the two calls the sidecar makes to its host:
//! a one-time registration and a blocking "next event" poll.
//! [`ExtensionsApiHost`] talks to a real host over HTTP; [`ScriptedHost`]
//! replays a script for tests.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use handoff_core::LifecycleEvent;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SidecarConfig;
use crate::error::{SidecarError, SidecarResult};

/// Header carrying the name the sidecar registers under.
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";

/// Header carrying the identifier returned by registration.
pub const EXTENSION_IDENTIFIER_HEADER: &str = "Lambda-Extension-Identifier";

/// Host lifecycle capability.
pub trait HostLifecycle: Send + Sync + 'static {
    /// Register with the host, returning the identifier for later calls.
    fn register(&self) -> impl Future<Output = SidecarResult<String>> + Send;

    /// Block until the host has an event for this sidecar.
    fn next_event(&self, id: &str) -> impl Future<Output = SidecarResult<LifecycleEvent>> + Send;
}

/// Host reached through the HTTP extensions API.
#[derive(Debug, Clone)]
pub struct ExtensionsApiHost {
    client: Client,
    base_url: String,
    extension_name: String,
}

/// Registration response body. Only used for logging.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RegisterResponse {
    function_name: Option<String>,
    function_version: Option<String>,
    handler: Option<String>,
}

impl ExtensionsApiHost {
    /// Create a host client for the API at `runtime_api` (`host:port`).
    pub fn new(runtime_api: &str, extension_name: impl Into<String>) -> SidecarResult<Self> {
        // No request timeout: `next_event` is a long poll.
        let client = Client::builder()
            .build()
            .map_err(|e| SidecarError::config(format!("failed to create host client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("http://{runtime_api}/2020-01-01/extension"),
            extension_name: extension_name.into(),
        })
    }

    /// Create a host client from configuration.
    pub fn from_config(config: &SidecarConfig) -> SidecarResult<Self> {
        let runtime_api = config
            .lifecycle
            .runtime_api
            .as_deref()
            .ok_or_else(|| SidecarError::config("host runtime API address is not set"))?;
        Self::new(runtime_api, config.lifecycle.extension_name.clone())
    }

    /// Base URL of the extensions API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl HostLifecycle for ExtensionsApiHost {
    async fn register(&self) -> SidecarResult<String> {
        let url = format!("{}/register", self.base_url);
        info!(url = %url, name = %self.extension_name, "registering with host");

        let response = self
            .client
            .post(&url)
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(&json!({ "events": ["INVOKE", "SHUTDOWN"] }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SidecarError::host_with_status(
                format!("registration rejected: {}", text.trim()),
                status.as_u16(),
            ));
        }

        let id = response
            .headers()
            .get(EXTENSION_IDENTIFIER_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| SidecarError::host("registration response has no identifier"))?;

        let details: RegisterResponse = response.json().await.unwrap_or_default();
        debug!(
            function_name = ?details.function_name,
            function_version = ?details.function_version,
            handler = ?details.handler,
            "registration details"
        );

        Ok(id)
    }

    async fn next_event(&self, id: &str) -> SidecarResult<LifecycleEvent> {
        let url = format!("{}/event/next", self.base_url);
        debug!(url = %url, "waiting for next event");

        let response = self
            .client
            .get(&url)
            .header(EXTENSION_IDENTIFIER_HEADER, id)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SidecarError::host_with_status(
                format!("event fetch rejected: {}", text.trim()),
                status.as_u16(),
            ));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// One scripted answer to `next_event`.
#[derive(Debug)]
enum Step {
    Event(LifecycleEvent),
    Fail(String),
}

/// Host test double.
///
/// `next_event` replays pushed events and failures in order and blocks, like
/// the real host, while nothing is queued. Clones share the same script.
#[derive(Debug, Clone)]
pub struct ScriptedHost {
    inner: Arc<ScriptedHostInner>,
}

#[derive(Debug)]
struct ScriptedHostInner {
    id: String,
    register_failure: Mutex<Option<String>>,
    tx: mpsc::UnboundedSender<Step>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>,
    register_calls: AtomicUsize,
    next_event_calls: AtomicUsize,
    seen_ids: Mutex<Vec<String>>,
}

impl ScriptedHost {
    /// Create a host that registers with `id` and has no events queued.
    pub fn new(id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ScriptedHostInner {
                id: id.into(),
                register_failure: Mutex::new(None),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                register_calls: AtomicUsize::new(0),
                next_event_calls: AtomicUsize::new(0),
                seen_ids: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make registration fail with `message`.
    #[must_use]
    pub fn failing_registration(self, message: impl Into<String>) -> Self {
        *self.inner.register_failure.lock() = Some(message.into());
        self
    }

    /// Queue an event.
    pub fn push_event(&self, event: LifecycleEvent) {
        let _ = self.inner.tx.send(Step::Event(event));
    }

    /// Queue a failed event fetch.
    pub fn push_failure(&self, message: impl Into<String>) {
        let _ = self.inner.tx.send(Step::Fail(message.into()));
    }

    /// Number of `register` calls.
    pub fn register_calls(&self) -> usize {
        self.inner.register_calls.load(Ordering::SeqCst)
    }

    /// Number of `next_event` calls.
    pub fn next_event_calls(&self) -> usize {
        self.inner.next_event_calls.load(Ordering::SeqCst)
    }

    /// Identifiers passed to `next_event`, in call order.
    pub fn seen_ids(&self) -> Vec<String> {
        self.inner.seen_ids.lock().clone()
    }
}

impl HostLifecycle for ScriptedHost {
    async fn register(&self) -> SidecarResult<String> {
        self.inner.register_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.register_failure.lock().clone();
        match failure {
            Some(message) => Err(SidecarError::host(message)),
            None => Ok(self.inner.id.clone()),
        }
    }

    async fn next_event(&self, id: &str) -> SidecarResult<LifecycleEvent> {
        self.inner.next_event_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.seen_ids.lock().push(id.to_string());

        let step = self.inner.rx.lock().await.recv().await;
        match step {
            Some(Step::Event(event)) => Ok(event),
            Some(Step::Fail(message)) => Err(SidecarError::host(message)),
            None => Err(SidecarError::host("script closed")),
        }
    }
}
