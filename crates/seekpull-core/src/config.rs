use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SeekpullError, SeekpullResult};

/// Top-level configuration (loaded from seekpull.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekpullConfig {
    pub fetch: FetchConfig,
    pub index: IndexConfig,
    pub log: LogConfig,
}

impl SeekpullConfig {
    pub fn validate(&self) -> SeekpullResult<()> {
        self.fetch.validate()?;
        self.index.validate()
    }
}

/// Knobs for one remote blob binding. Every field has a central default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Deadline for a single HTTP attempt, body included (default: 300)
    pub fetch_timeout_secs: u64,
    /// Transport-level retries after the first attempt (default: 9)
    pub max_retries: u32,
    /// Base backoff in milliseconds (default: 30)
    pub min_wait_ms: u64,
    /// Backoff cap in milliseconds (default: 300000)
    pub max_wait_ms: u64,
    /// Minimum time between two liveness probes (default: 60)
    pub check_interval_secs: u64,
    /// Never send multi-range requests
    pub force_single_range: bool,
}

impl FetchConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> SeekpullResult<()> {
        if self.fetch_timeout_secs == 0 {
            return Err(SeekpullError::config("fetch.fetch_timeout_secs must be > 0"));
        }
        if self.min_wait_ms > self.max_wait_ms {
            return Err(SeekpullError::config(format!(
                "fetch.min_wait_ms ({}) exceeds fetch.max_wait_ms ({})",
                self.min_wait_ms, self.max_wait_ms
            )));
        }
        Ok(())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 300,
            max_retries: 9,
            min_wait_ms: 30,
            max_wait_ms: 300_000,
            check_interval_secs: 60,
            force_single_range: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Nominal uncompressed bytes per span (default: 4 MiB)
    pub span_size: u64,
}

pub const DEFAULT_SPAN_SIZE: u64 = 4 << 20;

impl IndexConfig {
    pub fn validate(&self) -> SeekpullResult<()> {
        if self.span_size == 0 {
            return Err(SeekpullError::config("index.span_size must be > 0"));
        }
        Ok(())
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            span_size: DEFAULT_SPAN_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Read and validate a config file.
pub fn load(path: &std::path::Path) -> SeekpullResult<SeekpullConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: SeekpullConfig = toml::from_str(&content)
        .map_err(|e| SeekpullError::config(format!("parsing {}: {e}", path.display())))?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}
