//! Clients for the durable queue.
//!
//! The queue is an opaque at-least-once sink: once [`QueueClient::send`]
//! returns an [`Ack`] the payload is considered durable.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use handoff_core::{Ack, ForwardResult, SendError};
use http::StatusCode;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;

use crate::config::{QueueKind, SidecarConfig};
use crate::error::{SidecarError, SidecarResult};
use crate::sqs::SqsQueueClient;

/// A durable message sink.
pub trait QueueClient: Send + Sync + 'static {
    /// Send one payload.
    fn send(&self, payload: Bytes) -> impl Future<Output = ForwardResult> + Send;
}

impl<Q: QueueClient> QueueClient for Arc<Q> {
    fn send(&self, payload: Bytes) -> impl Future<Output = ForwardResult> + Send {
        (**self).send(payload)
    }
}

/// Queue client that POSTs payloads to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    client: Client,
    endpoint: String,
}

impl HttpQueueClient {
    /// Create a client from the sidecar configuration.
    pub fn new(config: &SidecarConfig) -> SidecarResult<Self> {
        let client = Client::builder()
            .timeout(config.queue.request_timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| SidecarError::config(format!("failed to create queue client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.queue.endpoint.clone(),
        })
    }

    /// Get the queue endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(alias = "MessageId")]
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

impl QueueClient for HttpQueueClient {
    async fn send(&self, payload: Bytes) -> ForwardResult {
        let response = self
            .client
            .post(&self.endpoint)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                // Connection failures and timeouts are worth another try.
                SendError::retriable(format!("queue request failed: {e}"))
            })?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            let text = response.text().await.unwrap_or_default();
            return Err(SendError {
                reason: format!("{}: {}", err.reason, text.trim()),
                retriable: err.retriable,
            });
        }

        let body = response.bytes().await.unwrap_or_default();
        let message_id = serde_json::from_slice::<SendMessageResponse>(&body)
            .ok()
            .and_then(|r| r.message_id);

        Ok(Ack { message_id })
    }
}

/// Map a queue HTTP status onto a send error, `None` for success.
pub fn classify_status(status: StatusCode) -> Option<SendError> {
    if status.is_success() {
        return None;
    }

    let reason = format!("queue responded with {status}");
    let retriable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    Some(SendError { reason, retriable })
}

/// The queue client selected by configuration.
#[derive(Debug, Clone)]
pub enum QueueBackend {
    /// Plain HTTP POST endpoint.
    Http(HttpQueueClient),
    /// Amazon SQS queue.
    Sqs(SqsQueueClient),
}

impl QueueBackend {
    /// Build the client named by `queue.kind`.
    pub async fn from_config(config: &SidecarConfig) -> SidecarResult<Self> {
        match config.queue.kind {
            QueueKind::Http => Ok(Self::Http(HttpQueueClient::new(config)?)),
            QueueKind::Sqs => Ok(Self::Sqs(SqsQueueClient::from_config(config).await)),
        }
    }

    /// The queue kind in use.
    pub fn kind(&self) -> QueueKind {
        match self {
            Self::Http(_) => QueueKind::Http,
            Self::Sqs(_) => QueueKind::Sqs,
        }
    }
}

impl QueueClient for QueueBackend {
    async fn send(&self, payload: Bytes) -> ForwardResult {
        match self {
            Self::Http(client) => client.send(payload).await,
            Self::Sqs(client) => client.send(payload).await,
        }
    }
}

/// In-memory queue for tests and local runs.
///
/// Results are taken from a script in order; once the script is exhausted
/// every send is acknowledged. Every payload passed to `send` is recorded,
/// whatever the result.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    script: Mutex<VecDeque<ForwardResult>>,
    fallback: Mutex<Option<ForwardResult>>,
    sent: Mutex<Vec<Bytes>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryQueue {
    /// Create a queue that acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that answers with `results` in order, then acks.
    pub fn scripted(results: impl IntoIterator<Item = ForwardResult>) -> Self {
        let queue = Self::new();
        queue.inner.script.lock().extend(results);
        queue
    }

    /// Create a queue that always answers with `result`.
    pub fn always(result: ForwardResult) -> Self {
        let queue = Self::new();
        *queue.inner.fallback.lock() = Some(result);
        queue
    }

    /// Delay every send by `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock() = Some(delay);
        self
    }

    /// Payloads passed to `send`, in call order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.inner.sent.lock().clone()
    }

    /// Number of `send` calls.
    pub fn send_count(&self) -> usize {
        self.inner.sent.lock().len()
    }
}

impl QueueClient for MemoryQueue {
    async fn send(&self, payload: Bytes) -> ForwardResult {
        self.inner.sent.lock().push(payload);

        let delay = *self.inner.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.inner.script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => self
                .inner
                .fallback
                .lock()
                .clone()
                .unwrap_or_else(|| Ok(Ack::default())),
        }
    }
}
