//! Configuration module for gpushare
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gpushare_core::monitor::{DEFAULT_BENIGN_XIDS, DEFAULT_WAIT_TIMEOUT};
use gpushare_core::ShareDegree;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Device backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Auto-detect device type
    #[default]
    Auto,
    /// NVIDIA GPU
    Nvidia,
    /// Scripted devices, for running without GPUs
    Mock,
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// XID codes treated as application errors (device stays healthy)
    #[serde(default = "default_benign_xids")]
    pub benign_xids: Vec<u64>,

    /// Maximum time a single wait for an XID event may block
    #[serde(with = "humantime_serde", default = "default_event_wait_timeout")]
    pub event_wait_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            benign_xids: default_benign_xids(),
            event_wait_timeout: default_event_wait_timeout(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device type to use
    #[serde(default)]
    pub device_type: DeviceType,

    /// Virtual devices per physical GPU, kept raw so that invalid values fall
    /// back to the default instead of failing the whole file
    #[serde(default)]
    pub share_degree: Option<Value>,

    /// Health monitoring configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            share_degree: None,
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.health.event_wait_timeout.is_zero() {
            anyhow::bail!("health.event_wait_timeout must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            anyhow::bail!("metrics.path must start with '/'");
        }
        Ok(())
    }

    /// Share degree, with the raw CLI/environment value taking precedence
    pub fn share_degree(&self, override_raw: Option<&str>) -> ShareDegree {
        if let Some(raw) = override_raw {
            return ShareDegree::parse(Some(raw));
        }

        match &self.share_degree {
            None | Some(Value::Null) => ShareDegree::default(),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(v) => ShareDegree::new(v),
                None => ShareDegree::parse(Some(&n.to_string())),
            },
            Some(Value::String(s)) => ShareDegree::parse(Some(s)),
            Some(other) => ShareDegree::parse(Some(&format!("{:?}", other))),
        }
    }
}

// Default value functions

fn default_benign_xids() -> Vec<u64> {
    DEFAULT_BENIGN_XIDS.to_vec()
}

fn default_event_wait_timeout() -> Duration {
    DEFAULT_WAIT_TIMEOUT
}

fn default_metrics_port() -> u16 {
    9400
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}
