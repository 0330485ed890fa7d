//! Invocation outcomes and the forward request wire format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Result of a single worker invocation.
///
/// Produced once by the business function and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// The business function returned a value.
    Success {
        /// Raw value returned by the business function.
        #[serde(with = "base64_bytes")]
        value: Bytes,
    },
    /// The business function failed.
    Failure {
        /// Error message of the failure.
        message: String,
    },
}

impl Outcome {
    /// Create a success outcome.
    pub fn success(value: impl Into<Bytes>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    /// Create a failure outcome.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    /// Check if this is a success outcome.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
        }
    }

    /// Convert into a plain `Result`, the shape the host expects back.
    pub fn into_result(self) -> Result<Bytes, String> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure { message } => Err(message),
        }
    }
}

impl<E: std::fmt::Display> From<Result<Bytes, E>> for Outcome {
    fn from(result: Result<Bytes, E>) -> Self {
        match result {
            Ok(value) => Self::Success { value },
            Err(e) => Self::Failure {
                message: e.to_string(),
            },
        }
    }
}

/// Payload handed from the worker to the sidecar, and from the sidecar to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    /// The event the worker was invoked with.
    #[serde(with = "base64_bytes")]
    pub original_event: Bytes,
    /// What the business function produced for that event.
    pub outcome: Outcome,
}

impl ForwardRequest {
    /// Create a new forward request.
    pub fn new(original_event: impl Into<Bytes>, outcome: Outcome) -> Self {
        Self {
            original_event: original_event.into(),
            outcome,
        }
    }

    /// Serialize into the JSON body used on the wire and on the queue.
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Parse a JSON body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Serde adapter encoding `Bytes` as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
