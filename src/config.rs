//! Transport configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and connection settings for talking to a feature service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Total number of attempts per request, including the first (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed pause before every attempt after the first, in seconds (default: 5).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Per-request timeout in seconds (default: 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry without certificate verification after a certificate failure.
    ///
    /// Off by default. Only meant for services behind broken TLS setups that
    /// the caller already trusts.
    #[serde(default)]
    pub allow_insecure_tls_fallback: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("restcache-gpkg/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
            allow_insecure_tls_fallback: false,
            user_agent: default_user_agent(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    #[must_use]
    pub fn with_insecure_tls_fallback(mut self, allow: bool) -> Self {
        self.allow_insecure_tls_fallback = allow;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::TransportConfig;

    #[test]
    fn empty_config_uses_defaults() {
        let config: TransportConfig = serde_json::from_str("{}").expect("parse config");
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_delay_secs, 5);
        assert!(!config.allow_insecure_tls_fallback);
    }

    #[test]
    fn partial_config_overrides_fields() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"max_attempts": 2, "allow_insecure_tls_fallback": true}"#)
                .expect("parse config");
        assert_eq!(config.max_attempts, 2);
        assert!(config.allow_insecure_tls_fallback);
        assert_eq!(config.timeout_secs, 60);
    }
}
