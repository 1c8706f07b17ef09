//! gpushare Core Library
//!
//! Splits each physical GPU into a fixed number of schedulable shares and
//! watches NVML XID events to report which shares have become unhealthy.

pub mod advertiser;
pub mod device;
pub mod metrics;
pub mod monitor;
pub mod partition;

// Re-export common types
pub use advertiser::DeviceAdvertiser;
pub use device::{DeviceError, DeviceInterface, DeviceType, FaultEvent, PhysicalDevice};
pub use monitor::{HealthMonitor, MonitorConfig, MonitorError};
pub use partition::{
    build_virtual_devices, decode_real_id, encode_id, Health, ShareDegree, VirtualDevice,
};
