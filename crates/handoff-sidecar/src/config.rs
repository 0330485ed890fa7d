//! Configuration for the handoff sidecar.
//!
//! Configuration is static: it is read once at process start (file, then
//! environment overrides) and never re-read.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SidecarError, SidecarResult};

/// Sidecar configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Local ingress settings.
    pub ingress: IngressSettings,
    /// Queue settings.
    pub queue: QueueSettings,
    /// Forwarding and retry settings.
    pub forward: ForwardSettings,
    /// Host lifecycle settings.
    pub lifecycle: LifecycleSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
}

impl SidecarConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SidecarConfigBuilder {
        SidecarConfigBuilder::default()
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> SidecarResult<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SidecarError::config(format!("failed to read config file: {e}")))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => toml::from_str(&content)
                .map_err(|e| SidecarError::config(format!("invalid TOML: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| SidecarError::config(format!("invalid JSON: {e}"))),
            _ => Err(SidecarError::config(format!(
                "unsupported config format: {extension}"
            ))),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Variables are prefixed with `HANDOFF_`. The queue URL and the host API
    /// address are also read from the names the deployment system uses
    /// (`DESTINATION_QUEUE_URL`, `AWS_LAMBDA_RUNTIME_API`).
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    #[must_use]
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = var("HANDOFF_LISTEN_PORT").and_then(|p| p.parse().ok()) {
            self.ingress.listen_port = port;
        }

        // The deployment names an SQS queue URL.
        if let Some(url) = var("DESTINATION_QUEUE_URL") {
            self.queue.endpoint = url;
            self.queue.kind = QueueKind::Sqs;
        }
        if let Some(url) = var("HANDOFF_QUEUE_ENDPOINT") {
            self.queue.endpoint = url;
        }
        if let Some(kind) = var("HANDOFF_QUEUE_KIND").and_then(|k| k.parse().ok()) {
            self.queue.kind = kind;
        }
        if let Some(region) = var("HANDOFF_QUEUE_REGION") {
            self.queue.region = Some(region);
        }

        if let Some(ms) = var("HANDOFF_SAFETY_MARGIN_MS").and_then(|v| v.parse().ok()) {
            self.forward.safety_margin = Duration::from_millis(ms);
        }

        if let Some(attempts) = var("HANDOFF_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.forward.max_attempts = Some(attempts);
        }

        if let Some(ms) = var("HANDOFF_DRAIN_GRACE_MS").and_then(|v| v.parse().ok()) {
            self.lifecycle.drain_grace = Duration::from_millis(ms);
        }

        if let Some(name) = var("HANDOFF_EXTENSION_NAME") {
            self.lifecycle.extension_name = name;
        }

        if let Some(api) = var("AWS_LAMBDA_RUNTIME_API") {
            self.lifecycle.runtime_api = Some(api);
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SidecarResult<()> {
        if self.queue.endpoint.is_empty() {
            return Err(SidecarError::config("queue endpoint is required"));
        }

        if !self.queue.endpoint.starts_with("http://")
            && !self.queue.endpoint.starts_with("https://")
        {
            return Err(SidecarError::config(
                "queue endpoint must start with http:// or https://",
            ));
        }

        let addr: IpAddr = self
            .ingress
            .listen_addr
            .parse()
            .map_err(|e| SidecarError::config(format!("invalid listen address: {e}")))?;
        if !addr.is_loopback() {
            return Err(SidecarError::config(
                "ingress must listen on a loopback address",
            ));
        }

        if self.ingress.max_payload_bytes == 0 {
            return Err(SidecarError::config("max_payload_bytes must be positive"));
        }

        if self.forward.max_attempts == Some(0) {
            return Err(SidecarError::config("max_attempts must be at least 1"));
        }

        if self.forward.backoff_factor < 1 {
            return Err(SidecarError::config("backoff_factor must be at least 1"));
        }

        Ok(())
    }

    /// Socket address of the ingress endpoint.
    pub fn ingress_addr(&self) -> SidecarResult<SocketAddr> {
        let ip: IpAddr = self
            .ingress
            .listen_addr
            .parse()
            .map_err(|e| SidecarError::config(format!("invalid listen address: {e}")))?;
        Ok(SocketAddr::new(ip, self.ingress.listen_port))
    }
}

/// Local ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSettings {
    /// Loopback address to bind to.
    pub listen_addr: String,
    /// Port the worker posts outcomes to.
    pub listen_port: u16,
    /// Maximum serialized payload size in bytes.
    pub max_payload_bytes: usize,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            listen_addr: handoff_core::DEFAULT_INGRESS_ADDR.to_string(),
            listen_port: handoff_core::DEFAULT_INGRESS_PORT,
            max_payload_bytes: 256 * 1024, // 256KB
        }
    }
}

/// Which queue client to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// POST the payload to `endpoint`.
    #[default]
    Http,
    /// `SendMessage` to the SQS queue URL in `endpoint`.
    Sqs,
}

impl std::str::FromStr for QueueKind {
    type Err = SidecarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "sqs" => Ok(Self::Sqs),
            other => Err(SidecarError::config(format!("unknown queue kind: {other}"))),
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue client to use.
    pub kind: QueueKind,
    /// URL payloads are posted to, or the SQS queue URL.
    pub endpoint: String,
    /// AWS region for SQS; the ambient AWS configuration when unset.
    pub region: Option<String>,
    /// Timeout for a single send request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            kind: QueueKind::Http,
            endpoint: String::new(),
            region: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Forwarding and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardSettings {
    /// No retry is started once the deadline is closer than this.
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: u32,
    /// Upper bound of a single delay.
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Optional cap on send attempts per payload. Without one, retries are
    /// bounded only by the deadline margin.
    pub max_attempts: Option<u32>,
    /// Lower bound on the time given to one attempt.
    #[serde(with = "humantime_serde")]
    pub min_attempt_timeout: Duration,
    /// Retry budget used when no invocation deadline is known.
    #[serde(with = "humantime_serde")]
    pub fallback_budget: Duration,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(1),
            backoff_base: Duration::from_millis(100),
            backoff_factor: 2,
            backoff_max: Duration::from_secs(2),
            max_attempts: None,
            min_attempt_timeout: Duration::from_millis(250),
            fallback_budget: Duration::from_secs(3),
        }
    }
}

/// Host lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Name the sidecar registers under.
    pub extension_name: String,
    /// `host:port` of the host lifecycle API.
    pub runtime_api: Option<String>,
    /// Consecutive event fetch failures tolerated before giving up.
    pub event_retry_ceiling: u32,
    /// Delay before the first event fetch retry.
    #[serde(with = "humantime_serde")]
    pub event_retry_base: Duration,
    /// How long shutdown waits for in-flight forwards.
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            extension_name: "handoff".to_string(),
            runtime_api: None,
            event_retry_ceiling: 3,
            event_retry_base: Duration::from_millis(100),
            drain_grace: Duration::from_secs(2),
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON formatted logs.
    pub json_logs: bool,
    /// Install the Prometheus recorder.
    pub metrics: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "handoff_sidecar=info,warn".to_string(),
            json_logs: true,
            metrics: true,
        }
    }
}

/// Builder for `SidecarConfig`.
#[derive(Debug, Default)]
pub struct SidecarConfigBuilder {
    config: SidecarConfig,
}

impl SidecarConfigBuilder {
    /// Set the listen port. Port `0` binds an ephemeral port.
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.ingress.listen_port = port;
        self
    }

    /// Set the listen address.
    #[must_use]
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.ingress.listen_addr = addr.into();
        self
    }

    /// Set the maximum payload size.
    #[must_use]
    pub fn max_payload_bytes(mut self, max: usize) -> Self {
        self.config.ingress.max_payload_bytes = max;
        self
    }

    /// Set the queue endpoint.
    #[must_use]
    pub fn queue_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.queue.endpoint = url.into();
        self
    }

    /// Set the queue kind.
    #[must_use]
    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.config.queue.kind = kind;
        self
    }

    /// Set the SQS region.
    #[must_use]
    pub fn queue_region(mut self, region: impl Into<String>) -> Self {
        self.config.queue.region = Some(region.into());
        self
    }

    /// Set the safety margin.
    #[must_use]
    pub fn safety_margin(mut self, margin: Duration) -> Self {
        self.config.forward.safety_margin = margin;
        self
    }

    /// Set the retry backoff parameters.
    #[must_use]
    pub fn backoff(mut self, base: Duration, factor: u32, max: Duration) -> Self {
        self.config.forward.backoff_base = base;
        self.config.forward.backoff_factor = factor;
        self.config.forward.backoff_max = max;
        self
    }

    /// Cap the number of send attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.forward.max_attempts = Some(attempts);
        self
    }

    /// Set the drain grace timeout.
    #[must_use]
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.config.lifecycle.drain_grace = grace;
        self
    }

    /// Set the event fetch retry ceiling.
    #[must_use]
    pub fn event_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.config.lifecycle.event_retry_ceiling = ceiling;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SidecarResult<SidecarConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Duration (de)serialization using short human-readable strings ("250ms", "2s").
mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |n: &str| n.trim().parse::<u64>().map_err(|_| format!("invalid duration: {s}"));

        if let Some(stripped) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(parse(stripped)?))
        } else if let Some(stripped) = s.strip_suffix('s') {
            Ok(Duration::from_secs(parse(stripped)?))
        } else if let Some(stripped) = s.strip_suffix('m') {
            Ok(Duration::from_secs(parse(stripped)? * 60))
        } else {
            // Assume milliseconds
            Ok(Duration::from_millis(parse(s)?))
        }
    }
}
