//! Amazon SQS queue client.
//!
//! Sends each payload with `SendMessage` to the configured queue URL. The
//! SDK's own retries are disabled: the forwarder decides when to retry,
//! bounded by the invocation deadline.

use aws_sdk_sqs::config::http::HttpResponse;
use aws_sdk_sqs::config::retry::RetryConfig;
use aws_sdk_sqs::config::timeout::TimeoutConfig;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::operation::send_message::SendMessageError;
use aws_sdk_sqs::Client;
use bytes::Bytes;
use handoff_core::{Ack, ForwardResult, SendError};
use http::StatusCode;

use crate::config::SidecarConfig;
use crate::queue::{classify_status, QueueClient};

/// Error codes SQS returns with a 4xx status that are still worth retrying.
const THROTTLING_CODES: &[&str] = &[
    "RequestThrottled",
    "ThrottlingException",
    "KmsThrottled",
    "ServiceUnavailable",
];

/// Queue client backed by `aws-sdk-sqs`.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
}

impl SqsQueueClient {
    /// Create a client using the ambient AWS configuration (environment,
    /// profile or container credentials).
    pub async fn from_config(config: &SidecarConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.queue.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let sqs_config = aws_sdk_sqs::config::Builder::from(&sdk_config)
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.queue.request_timeout)
                    .build(),
            )
            .build();

        Self::from_client(Client::from_conf(sqs_config), config.queue.endpoint.clone())
    }

    /// Create from an existing SQS client.
    pub fn from_client(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// The queue URL messages are sent to.
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

impl QueueClient for SqsQueueClient {
    async fn send(&self, payload: Bytes) -> ForwardResult {
        let body = String::from_utf8(payload.to_vec())
            .map_err(|e| SendError::fatal(format!("payload is not valid UTF-8: {e}")))?;

        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| send_error(&e))?;

        Ok(Ack {
            message_id: output.message_id().map(str::to_string),
        })
    }
}

fn send_error(err: &SdkError<SendMessageError, HttpResponse>) -> SendError {
    let detail = DisplayErrorContext(err).to_string();
    match err {
        SdkError::ServiceError(service) => classify_service_error(
            service.raw().status().as_u16(),
            service.err().code(),
            &detail,
        ),
        SdkError::ConstructionFailure(_) => {
            SendError::fatal(format!("invalid SendMessage request: {detail}"))
        }
        // Dispatch failures, timeouts and unreadable responses.
        _ => SendError::retriable(format!("queue request failed: {detail}")),
    }
}

/// Map an SQS service error onto a send error.
///
/// Throttling codes are retriable whatever their status; everything else
/// follows the same status rules as the HTTP queue.
pub fn classify_service_error(status: u16, code: Option<&str>, detail: &str) -> SendError {
    let reason = format!("SQS rejected message: {detail}");
    if code.is_some_and(|c| THROTTLING_CODES.contains(&c)) {
        return SendError::retriable(reason);
    }

    let retriable = StatusCode::from_u16(status)
        .ok()
        .and_then(classify_status)
        .map_or(true, |e| e.retriable);
    SendError { reason, retriable }
}
