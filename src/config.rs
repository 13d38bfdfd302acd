//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or empty)
//! file is valid.
//!
//! ```toml
//! worker_threads = 8
//!
//! [device]
//! name = "accelerator"
//! memory_bytes = 268435456
//!
//! [watchdog]
//! enabled = true
//! threshold_ms = 5000
//! poll_interval_ms = 1000
//!
//! [acquisition]
//! queue_depth = 4
//! ```

use crate::runtime::scheduler::DEFAULT_WORKER_THREADS;
use crate::{Result, WavegraphError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executor pool size
    pub worker_threads: usize,
    pub device: DeviceConfig,
    pub watchdog: WatchdogConfig,
    pub acquisition: AcquisitionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            device: DeviceConfig::default(),
            watchdog: WatchdogConfig::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

/// Accelerator device model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// Device memory budget
    pub memory_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "accelerator".to_string(),
            memory_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Slow refresh reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// A refresh running longer than this is reported
    pub threshold_ms: u64,
    pub poll_interval_ms: u64,
}

impl WatchdogConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 5000,
            poll_interval_ms: 1000,
        }
    }
}

/// Background instrument polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Acquisitions buffered between the polling thread and the pipeline
    pub queue_depth: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self { queue_depth: 4 }
    }
}

impl EngineConfig {
    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| WavegraphError::read_file(path, e))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| WavegraphError::write_file(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(WavegraphError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.acquisition.queue_depth == 0 {
            return Err(WavegraphError::InvalidConfig(
                "acquisition.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.watchdog.enabled && self.watchdog.poll_interval_ms == 0 {
            return Err(WavegraphError::InvalidConfig(
                "watchdog.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
