//! Worker-side configuration.

use std::time::Duration;

use handoff_core::{DEFAULT_INGRESS_ADDR, DEFAULT_INGRESS_PORT, SAFETY_THRESHOLD_MS};

/// Settings for the [`Handoff`](crate::Handoff) middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    /// URL of the sidecar ingress.
    pub ingress_url: String,

    /// Below this much remaining time the outcome is not forwarded.
    pub safety_threshold: Duration,

    /// Optional bound on the submission call. `None` waits for the sidecar,
    /// which bounds itself by the invocation deadline.
    pub request_timeout: Option<Duration>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            ingress_url: format!("http://{DEFAULT_INGRESS_ADDR}:{DEFAULT_INGRESS_PORT}/"),
            safety_threshold: Duration::from_millis(SAFETY_THRESHOLD_MS),
            request_timeout: None,
        }
    }
}

impl HandoffConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `var`.
    ///
    /// `HANDOFF_INGRESS_URL` wins over `HANDOFF_LISTEN_PORT`, which only
    /// changes the port of the loopback default.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = var("HANDOFF_LISTEN_PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.ingress_url = format!("http://{DEFAULT_INGRESS_ADDR}:{port}/");
        }
        if let Some(url) = var("HANDOFF_INGRESS_URL").filter(|u| !u.is_empty()) {
            self.ingress_url = url;
        }
        self
    }

    /// Set the ingress URL.
    pub fn with_ingress_url(mut self, url: impl Into<String>) -> Self {
        self.ingress_url = url.into();
        self
    }

    /// Set the safety threshold.
    pub fn with_safety_threshold(mut self, threshold: Duration) -> Self {
        self.safety_threshold = threshold;
        self
    }

    /// Bound the submission call.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HandoffConfig::default();
        assert_eq!(config.ingress_url, "http://127.0.0.1:8080/");
        assert_eq!(config.safety_threshold, Duration::from_millis(1000));
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn test_port_override() {
        let config = HandoffConfig::default().with_overrides(vars(&[("HANDOFF_LISTEN_PORT", "9099")]));
        assert_eq!(config.ingress_url, "http://127.0.0.1:9099/");
    }

    #[test]
    fn test_url_override_wins() {
        let config = HandoffConfig::default().with_overrides(vars(&[
            ("HANDOFF_LISTEN_PORT", "9099"),
            ("HANDOFF_INGRESS_URL", "http://127.0.0.1:7000/"),
        ]));
        assert_eq!(config.ingress_url, "http://127.0.0.1:7000/");
    }

    #[test]
    fn test_invalid_port_is_ignored() {
        let config = HandoffConfig::default().with_overrides(vars(&[("HANDOFF_LISTEN_PORT", "abc")]));
        assert_eq!(config.ingress_url, "http://127.0.0.1:8080/");
    }
}
