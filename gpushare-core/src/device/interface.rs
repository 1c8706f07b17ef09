//! Device interface trait and common types
//!
//! Defines the hardware boundary: enumeration of physical GPUs and a blocking
//! subscription to critical fault (XID) events.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Auto-detect device type
    #[default]
    Auto,
    /// NVIDIA GPU
    Nvidia,
    /// Scripted devices, no hardware required
    Mock,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "auto"),
            DeviceType::Nvidia => write!(f, "nvidia"),
            DeviceType::Mock => write!(f, "mock"),
        }
    }
}

/// A physical accelerator as enumerated by the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalDevice {
    /// Device index (0-based, enumeration order)
    pub index: u32,
    /// Driver-assigned unique identifier
    pub uuid: String,
    /// Device name/model
    pub name: String,
}

impl fmt::Display for PhysicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{} ({})", self.index, self.uuid)
    }
}

/// Kind of event delivered by a fault subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Critical XID error
    CriticalXid,
    /// Any other event type the driver reports
    Other,
}

/// A hardware fault event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultEvent {
    /// Event type tag
    pub kind: FaultKind,
    /// Physical device uuid, `None` when the event applies to every device
    pub uuid: Option<String>,
    /// Error data (the XID code for critical XID events)
    pub xid: Option<u64>,
    /// When the event was received
    pub observed_at: DateTime<Utc>,
}

impl FaultEvent {
    /// Create a critical XID event
    pub fn critical_xid(uuid: Option<&str>, xid: u64) -> Self {
        Self {
            kind: FaultKind::CriticalXid,
            uuid: uuid.map(str::to_string),
            xid: Some(xid),
            observed_at: Utc::now(),
        }
    }

    /// Create an event of a non-critical type
    pub fn other(uuid: Option<&str>) -> Self {
        Self {
            kind: FaultKind::Other,
            uuid: uuid.map(str::to_string),
            xid: None,
            observed_at: Utc::now(),
        }
    }

    /// Whether this event carries a usable device uuid
    pub fn target_uuid(&self) -> Option<&str> {
        self.uuid.as_deref().filter(|u| !u.is_empty())
    }
}

/// Errors that can occur during device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// NVML initialization failed
    #[error("Failed to initialize NVML: {0}")]
    NvmlInitError(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to query device
    #[error("Failed to query device: {0}")]
    QueryError(String),

    /// Hardware or driver does not support the requested operation
    #[error("Not Supported: {0}")]
    NotSupported(String),

    /// Event subscription failed
    #[error("Event subscription error: {0}")]
    EventError(String),
}

impl DeviceError {
    /// Whether the driver reported the operation as unsupported
    pub fn is_not_supported(&self) -> bool {
        matches!(self, DeviceError::NotSupported(_))
    }
}

/// A live subscription to critical fault events.
///
/// All calls block the current thread; run them off the async executor.
pub trait FaultSubscription {
    /// Register interest in critical XID events for one physical device
    fn register(&mut self, uuid: &str) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for the next event. `Ok(None)` on timeout.
    fn wait(&mut self, timeout: Duration) -> Result<Option<FaultEvent>, DeviceError>;

    /// Release the subscription and everything registered on it
    fn release(self: Box<Self>) -> Result<(), DeviceError>;
}

/// Device interface trait
///
/// This trait provides a unified interface over GPU backends.
/// Implementations should be thread-safe.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// List all available devices in enumeration order
    async fn list_devices(&self) -> Result<Vec<PhysicalDevice>, DeviceError>;

    /// Open a new, empty fault subscription
    fn subscribe(&self) -> Result<Box<dyn FaultSubscription>, DeviceError>;

    /// Get the device type
    fn device_type(&self) -> DeviceType;
}

/// Get human-readable description for XID error codes
pub fn describe_xid(code: u64) -> &'static str {
    match code {
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        32 => "Invalid or corrupted push buffer stream",
        38 => "Driver firmware error",
        43 => "GPU stopped processing",
        45 => "Preemptive cleanup, due to previous errors",
        48 => "Double Bit ECC Error",
        61 => "Internal micro-controller breakpoint/warning",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        74 => "NVLINK Error",
        79 => "GPU has fallen off the bus",
        92 => "High single-bit ECC error rate",
        94 => "Contained ECC error",
        95 => "Uncontained ECC error",
        _ => "Unknown XID error",
    }
}
