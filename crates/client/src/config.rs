//! Client configuration.
//!
//! Every field has a default, so a partial `config.toml` deserializes cleanly.
//! Environment overrides are applied on top by [`ClientConfig::apply_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::{ClientError, Result};

pub const DEFAULT_URL: &str = "ws://127.0.0.1:9527/ws";

pub const ENV_URL: &str = "AEROLINK_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "AEROLINK_REQUEST_TIMEOUT_MS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "AEROLINK_HEARTBEAT_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Default per-request deadline. `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    /// `None` disables the heartbeat.
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: u64,
    pub backoff: BackoffConfig,
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: Some(30_000),
            heartbeat_interval_ms: Some(15_000),
            heartbeat_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
            client_name: "aerolink".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Apply `AEROLINK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. A timeout value of `0` or
    /// `off` disables that timer.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_URL).filter(|value| !value.trim().is_empty()) {
            self.url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = parse_optional_millis(ENV_REQUEST_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HEARTBEAT_INTERVAL_MS) {
            self.heartbeat_interval_ms = parse_optional_millis(ENV_HEARTBEAT_INTERVAL_MS, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| ClientError::Config(format!("url has no scheme: {}", self.url)))?;
        if !matches!(scheme.as_str(), "ws" | "wss" | "memory") {
            return Err(ClientError::Config(format!(
                "unsupported url scheme `{scheme}` (expected ws, wss or memory)"
            )));
        }

        let timers = [
            ("connect_timeout_ms", Some(self.connect_timeout_ms)),
            ("handshake_timeout_ms", Some(self.handshake_timeout_ms)),
            ("request_timeout_ms", self.request_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", Some(self.heartbeat_timeout_ms)),
        ];
        for (name, value) in timers {
            if value == Some(0) {
                return Err(ClientError::Config(format!("{name} must be greater than zero")));
            }
        }

        let backoff = &self.backoff;
        if backoff.initial_ms == 0 || backoff.max_ms < backoff.initial_ms {
            return Err(ClientError::Config(
                "backoff requires 0 < initial_ms <= max_ms".to_string(),
            ));
        }
        if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
            return Err(ClientError::Config(
                "backoff.multiplier must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&backoff.jitter) {
            return Err(ClientError::Config(
                "backoff.jitter must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_optional_millis(key: &str, raw: &str) -> Result<Option<u64>> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    match raw.parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(millis) => Ok(Some(millis)),
        Err(_) => Err(ClientError::Config(format!(
            "{key} must be a number of milliseconds, got `{raw}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"url":"wss://example.test/ws","backoff":{"max_ms":5000}}"#)
                .expect("deserialize");
        assert_eq!(config.url, "wss://example.test/ws");
        assert_eq!(config.backoff.max_ms, 5_000);
        assert_eq!(config.backoff.initial_ms, 1_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn env_overrides_apply_and_disable() {
        let mut config = ClientConfig::default();
        config
            .apply_overrides(lookup(&[
                (ENV_URL, "ws://10.0.0.2:9527/ws"),
                (ENV_REQUEST_TIMEOUT_MS, "2500"),
                (ENV_HEARTBEAT_INTERVAL_MS, "off"),
            ]))
            .expect("overrides");
        assert_eq!(config.url, "ws://10.0.0.2:9527/ws");
        assert_eq!(config.request_timeout_ms, Some(2_500));
        assert_eq!(config.heartbeat_interval_ms, None);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = ClientConfig::default();
        let err = config
            .apply_overrides(lookup(&[(ENV_REQUEST_TIMEOUT_MS, "soon")]))
            .expect_err("garbage rejected");
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let http = ClientConfig::with_url("http://127.0.0.1:9527");
        assert!(http.validate().is_err());

        let mut zero = ClientConfig::default();
        zero.handshake_timeout_ms = 0;
        assert!(zero.validate().is_err());

        let mut jitter = ClientConfig::default();
        jitter.backoff.jitter = 1.0;
        assert!(jitter.validate().is_err());

        let mut shrinking = ClientConfig::default();
        shrinking.backoff.multiplier = 0.5;
        assert!(shrinking.validate().is_err());

        assert!(ClientConfig::with_url("memory://test").validate().is_ok());
    }
}
