//! Data directory resolution.
//!
//! Resolved once at startup from: `--data-dir` > `AEROLINK_DATA_DIR` env > `~/.aerolink`.

use std::path::{Path, PathBuf};

use anyhow::Context;

pub const ENV_DATA_DIR: &str = "AEROLINK_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        Self::resolve_with(
            explicit,
            std::env::var(ENV_DATA_DIR).ok(),
            dirs::home_dir(),
        )
    }

    fn resolve_with(
        explicit: Option<&Path>,
        env_value: Option<String>,
        home: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
            PathBuf::from(value)
        } else {
            home.context("cannot locate the home directory; pass --data-dir")?
                .join(".aerolink")
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.log_dir())
    }
}
