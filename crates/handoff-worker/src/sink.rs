//! Where the middleware hands outcomes.
//!
//! [`IngressClient`] posts to the sidecar; [`RecordingSink`] keeps every
//! submission in memory for tests.

use std::future::Future;
use std::sync::Arc;

use handoff_core::ForwardRequest;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::HandoffConfig;
use crate::error::ForwardingError;

/// Accepts a forward request and resolves once it is durable.
pub trait OutcomeSink: Send + Sync {
    /// Submit one request and wait for the sidecar's answer.
    fn submit(
        &self,
        request: &ForwardRequest,
    ) -> impl Future<Output = Result<(), ForwardingError>> + Send;
}

impl<S: OutcomeSink> OutcomeSink for Arc<S> {
    fn submit(
        &self,
        request: &ForwardRequest,
    ) -> impl Future<Output = Result<(), ForwardingError>> + Send {
        (**self).submit(request)
    }
}

/// HTTP client for the sidecar ingress.
#[derive(Debug, Clone)]
pub struct IngressClient {
    client: Client,
    url: String,
}

/// Error body the sidecar sends with non-200 answers.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RejectionBody {
    message: String,
    retriable: bool,
}

impl IngressClient {
    /// Create a client for the configured ingress URL.
    pub fn new(config: &HandoffConfig) -> Result<Self, ForwardingError> {
        let mut builder = Client::builder().no_proxy();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ForwardingError::Transport(format!("failed to create client: {e}")))?;

        Ok(Self {
            client,
            url: config.ingress_url.clone(),
        })
    }

    /// Ingress URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl OutcomeSink for IngressClient {
    async fn submit(&self, request: &ForwardRequest) -> Result<(), ForwardingError> {
        let body = request
            .to_payload()
            .map_err(|e| ForwardingError::Encode(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ForwardingError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!("outcome handed to sidecar");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let rejection: RejectionBody = serde_json::from_str(&text).unwrap_or_else(|_| RejectionBody {
            message: text.trim().to_string(),
            retriable: false,
        });

        Err(ForwardingError::Rejected {
            status: status.as_u16(),
            message: rejection.message,
            retriable: rejection.retriable,
        })
    }
}

/// In-memory sink for tests.
///
/// Records every submitted request and answers with a fixed result,
/// success by default. Clones share the same record.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    submitted: Arc<Mutex<Vec<ForwardRequest>>>,
    answer: Result<(), ForwardingError>,
}

impl RecordingSink {
    /// Create a sink that accepts everything.
    pub fn new() -> Self {
        Self {
            submitted: Arc::new(Mutex::new(Vec::new())),
            answer: Ok(()),
        }
    }

    /// Create a sink that fails every submission with `err`.
    pub fn failing(err: ForwardingError) -> Self {
        Self {
            answer: Err(err),
            ..Self::new()
        }
    }

    /// Requests submitted so far.
    pub fn submitted(&self) -> Vec<ForwardRequest> {
        self.submitted.lock().clone()
    }

    /// Number of submissions.
    pub fn count(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeSink for RecordingSink {
    async fn submit(&self, request: &ForwardRequest) -> Result<(), ForwardingError> {
        self.submitted.lock().push(request.clone());
        self.answer.clone()
    }
}
