//! CLI configuration loading.
//!
//! Layers, lowest first: defaults, `<data dir>/config.toml`, `AEROLINK_*`
//! environment, command-line flags. The file uses [`ClientConfig`]'s own field
//! names, so every key is optional:
//!
//! ```toml
//! url = "wss://devbox.local:9527/ws"
//! request_timeout_ms = 60000
//!
//! [backoff]
//! max_ms = 10000
//! ```

use std::path::Path;

use aerolink_client::ClientConfig;
use anyhow::Context;

/// Read `path` as a client config. A missing file yields the defaults unless
/// the path was given explicitly.
pub fn load_file(path: &Path, required: bool) -> anyhow::Result<ClientConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            Ok(ClientConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Command-line overrides applied last.
#[derive(Debug, Default, Clone)]
pub struct FlagOverrides {
    pub url: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

pub fn resolve(
    path: &Path,
    required: bool,
    env: impl Fn(&str) -> Option<String>,
    flags: &FlagOverrides,
) -> anyhow::Result<ClientConfig> {
    let mut config = load_file(path, required)?;
    config
        .apply_overrides(env)
        .context("invalid AEROLINK_* environment override")?;
    if let Some(url) = &flags.url {
        config.url.clone_from(url);
    }
    if let Some(timeout) = flags.request_timeout_ms {
        config.request_timeout_ms = Some(timeout);
    }
    config.validate().context("invalid client configuration")?;
    Ok(config)
}
