use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub drain: DrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Live vnode count above which the drain worker starts reclaiming
    /// parked vnodes.
    #[serde(default = "CacheConfig::default_desired_vnodes")]
    pub desired_vnodes: usize,
}

impl CacheConfig {
    pub const DEFAULT_DESIRED_VNODES: usize = 65_536;

    fn default_desired_vnodes() -> usize {
        Self::DEFAULT_DESIRED_VNODES
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            desired_vnodes: Self::DEFAULT_DESIRED_VNODES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// How often the drain worker re-checks the live count without being
    /// signalled.
    #[serde(default = "DrainConfig::default_interval_ms")]
    pub interval_ms: u64,
    /// Delay before rescanning when no free-list victim could be taken.
    #[serde(default = "DrainConfig::default_backoff_ms")]
    pub backoff_ms: u64,
}

impl DrainConfig {
    pub const DEFAULT_INTERVAL_MS: u64 = 1000;
    pub const DEFAULT_BACKOFF_MS: u64 = 100;

    fn default_interval_ms() -> u64 {
        Self::DEFAULT_INTERVAL_MS
    }

    fn default_backoff_ms() -> u64 {
        Self::DEFAULT_BACKOFF_MS
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.max(1))
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::DEFAULT_INTERVAL_MS,
            backoff_ms: Self::DEFAULT_BACKOFF_MS,
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# vcache configuration

[cache]
# Live vnode count above which parked vnodes are reclaimed in the background.
desired_vnodes = 65536

[drain]
# Periodic re-check of the live count, in milliseconds.
interval_ms = 1000
# Back-off when every parked vnode is busy, in milliseconds.
backoff_ms = 100
"#;

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = path.as_ref().to_string_lossy();
        let expanded = shellexpand::full(&raw)
            .with_context(|| format!("Failed to expand config path {raw}"))?;
        let content = std::fs::read_to_string(expanded.as_ref())
            .with_context(|| format!("Failed to read config file {expanded}"))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}
