//! Device partitioning
//!
//! Turns N physical GPUs into N×K virtual devices. A virtual device id is the
//! physical uuid followed by `-` and a zero-padded 1-based share index, so the
//! physical uuid is recovered by cutting at the last `-`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::device::{DeviceError, DeviceInterface, PhysicalDevice};

/// Separator between the physical uuid and the share index
pub const SHARE_SEPARATOR: char = '-';

/// Share degree used when none (or an invalid one) is configured
pub const DEFAULT_SHARE_DEGREE: u32 = 5;

/// Number of virtual devices advertised per physical device (always ≥ 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareDegree(u32);

impl ShareDegree {
    /// Coerce a configured value, falling back to the default when it is not positive
    pub fn new(value: i64) -> Self {
        match u32::try_from(value) {
            Ok(v) if v >= 1 => Self(v),
            _ => {
                warn!(
                    value,
                    default = DEFAULT_SHARE_DEGREE,
                    "Share degree must be a positive integer, using default"
                );
                Self::default()
            }
        }
    }

    /// Parse a raw setting (e.g. an environment variable)
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::default(),
            Some(s) => match s.parse::<i64>() {
                Ok(v) => Self::new(v),
                Err(_) => {
                    warn!(
                        value = s,
                        default = DEFAULT_SHARE_DEGREE,
                        "Share degree is not an integer, using default"
                    );
                    Self::default()
                }
            },
        }
    }

    /// The share degree as a count
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for ShareDegree {
    fn default() -> Self {
        Self(DEFAULT_SHARE_DEGREE)
    }
}

impl fmt::Display for ShareDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of an advertised device, as reported to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// A schedulable share of a physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualDevice {
    #[serde(rename = "ID")]
    pub id: String,
    pub health: Health,
}

impl VirtualDevice {
    /// Create a healthy virtual device for share `share` of `uuid`
    pub fn new(uuid: &str, share: u32) -> Self {
        Self {
            id: encode_id(uuid, share),
            health: Health::Healthy,
        }
    }

    /// Uuid of the physical device this share belongs to
    pub fn physical_uuid(&self) -> Option<&str> {
        decode_real_id(&self.id)
    }

    /// Copy of this device reported as unhealthy
    pub fn unhealthy(&self) -> Self {
        Self {
            id: self.id.clone(),
            health: Health::Unhealthy,
        }
    }
}

impl fmt::Display for VirtualDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Build the virtual device id for a share, e.g. `GPU-fef8...-003`
pub fn encode_id(uuid: &str, share: u32) -> String {
    format!("{}{}{:03}", uuid, SHARE_SEPARATOR, share)
}

/// Recover the physical uuid from a virtual device id.
///
/// Returns `None` for ids with no separator; `encode_id` never produces those.
pub fn decode_real_id(id: &str) -> Option<&str> {
    id.rfind(SHARE_SEPARATOR).map(|pos| &id[..pos])
}

/// Expand physical devices into virtual devices.
///
/// Output follows enumeration order, then share index `1..=degree`.
pub fn build_virtual_devices(devices: &[PhysicalDevice], degree: ShareDegree) -> Vec<VirtualDevice> {
    let per_device = degree.get();
    let mut out = Vec::with_capacity(devices.len() * per_device as usize);

    for device in devices {
        out.extend((1..=per_device).map(|share| VirtualDevice::new(&device.uuid, share)));
    }

    out
}

/// Enumerate physical devices and partition them.
///
/// Enumeration failures are returned unchanged; the caller treats them as fatal.
pub async fn partition(
    device: &dyn DeviceInterface,
    degree: ShareDegree,
) -> Result<Vec<VirtualDevice>, DeviceError> {
    let physical = device.list_devices().await?;
    let virtual_devices = build_virtual_devices(&physical, degree);

    info!(
        physical = physical.len(),
        share_degree = %degree,
        virtual_devices = virtual_devices.len(),
        "Partitioned GPU devices"
    );

    Ok(virtual_devices)
}
