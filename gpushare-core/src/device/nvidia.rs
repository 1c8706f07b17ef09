//! NVIDIA GPU device implementation
//!
//! Uses NVML (NVIDIA Management Library) for enumeration and XID event
//! subscriptions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::{NvmlError, NvmlErrorWithSource};
use nvml_wrapper::{EventSet, Nvml};
use once_cell::sync::OnceCell;
use tracing::{debug, trace, warn};

use super::{
    DeviceError, DeviceInterface, DeviceType, FaultEvent, FaultKind, FaultSubscription,
    PhysicalDevice,
};

/// Global NVML instance
static NVML: OnceCell<Nvml> = OnceCell::new();

/// Get or initialize the global NVML instance
fn get_nvml() -> Result<&'static Nvml, DeviceError> {
    NVML.get_or_try_init(|| Nvml::init().map_err(|e| DeviceError::NvmlInitError(e.to_string())))
}

fn map_nvml_error(uuid: &str, error: NvmlError) -> DeviceError {
    match error {
        NvmlError::NotSupported => DeviceError::NotSupported(uuid.to_string()),
        NvmlError::NotFound => DeviceError::DeviceNotFound(uuid.to_string()),
        other => DeviceError::EventError(format!("{}: {}", uuid, other)),
    }
}

/// NVIDIA GPU device implementation
pub struct NvidiaDevice {
    nvml: &'static Nvml,
}

impl NvidiaDevice {
    /// Create a new NVIDIA device interface
    pub fn new() -> Result<Self, DeviceError> {
        let nvml = get_nvml()?;
        Ok(Self { nvml })
    }
}

#[async_trait]
impl DeviceInterface for NvidiaDevice {
    async fn list_devices(&self) -> Result<Vec<PhysicalDevice>, DeviceError> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| DeviceError::QueryError(e.to_string()))?;

        let mut devices = Vec::with_capacity(count as usize);

        for i in 0..count {
            let device = self
                .nvml
                .device_by_index(i)
                .map_err(|e| DeviceError::QueryError(e.to_string()))?;

            let uuid = device
                .uuid()
                .map_err(|e| DeviceError::QueryError(format!("GPU{} uuid: {}", i, e)))?;

            let name = device.name().unwrap_or_else(|_| "unknown".to_string());

            devices.push(PhysicalDevice {
                index: i,
                uuid,
                name,
            });
        }

        Ok(devices)
    }

    fn subscribe(&self) -> Result<Box<dyn FaultSubscription>, DeviceError> {
        let set = self
            .nvml
            .create_event_set()
            .map_err(|e| DeviceError::EventError(e.to_string()))?;

        Ok(Box::new(NvidiaSubscription {
            nvml: self.nvml,
            set: Some(set),
            registered: Vec::new(),
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Nvidia
    }
}

/// NVML event set holding critical XID registrations
struct NvidiaSubscription {
    nvml: &'static Nvml,
    // Moved into `register_events` and handed back on success; `None` only
    // while a registration is in flight or after a failed rebuild.
    set: Option<EventSet<'static>>,
    registered: Vec<String>,
}

impl NvidiaSubscription {
    fn event_set(&self) -> Result<&EventSet<'static>, DeviceError> {
        self.set
            .as_ref()
            .ok_or_else(|| DeviceError::EventError("event set lost".to_string()))
    }

    /// Replace the set NVML released after a failed registration with a new
    /// one holding every device registered so far
    fn rebuild(&mut self) -> Result<(), DeviceError> {
        let mut set = self
            .nvml
            .create_event_set()
            .map_err(|e| DeviceError::EventError(format!("recreating event set: {}", e)))?;

        for uuid in &self.registered {
            let device = self
                .nvml
                .device_by_uuid(uuid.as_str())
                .map_err(|e| DeviceError::EventError(format!("{}: {}", uuid, e)))?;
            set = device
                .register_events(EventTypes::CRITICAL_XID_ERROR, set)
                .map_err(|e| {
                    DeviceError::EventError(format!("re-registering {}: {}", uuid, e.error))
                })?;
        }

        debug!(devices = self.registered.len(), "Rebuilt XID event set");
        self.set = Some(set);
        Ok(())
    }
}

impl FaultSubscription for NvidiaSubscription {
    fn register(&mut self, uuid: &str) -> Result<(), DeviceError> {
        let device = self
            .nvml
            .device_by_uuid(uuid)
            .map_err(|e| map_nvml_error(uuid, e))?;

        let set = self
            .set
            .take()
            .ok_or_else(|| DeviceError::EventError("event set lost".to_string()))?;

        match device.register_events(EventTypes::CRITICAL_XID_ERROR, set) {
            Ok(set) => {
                self.set = Some(set);
                self.registered.push(uuid.to_string());
                debug!(uuid = uuid, "Registered for critical XID events");
                Ok(())
            }
            // NVML releases the set on every registration error.
            Err(NvmlErrorWithSource { error, source }) => {
                if let Some(release_error) = source {
                    warn!(uuid = uuid, error = %release_error, "Failed to release XID event set");
                }
                self.rebuild()?;
                Err(map_nvml_error(uuid, error))
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<FaultEvent>, DeviceError> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        match self.event_set()?.wait(timeout_ms) {
            Ok(data) => {
                let kind = if data.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
                    FaultKind::CriticalXid
                } else {
                    FaultKind::Other
                };
                // A null device handle means the event applies to every GPU.
                let uuid = data.device.uuid().ok();
                let xid = match data.event_data {
                    Some(XidError::Value(code)) => Some(code),
                    Some(XidError::Unknown) | None => None,
                };

                Ok(Some(FaultEvent {
                    kind,
                    uuid,
                    xid,
                    observed_at: Utc::now(),
                }))
            }
            Err(NvmlError::Timeout) => {
                trace!(timeout_ms, "No XID event before timeout");
                Ok(None)
            }
            Err(e) => Err(DeviceError::EventError(e.to_string())),
        }
    }

    fn release(mut self: Box<Self>) -> Result<(), DeviceError> {
        match self.set.take() {
            Some(set) => set
                .release_events()
                .map_err(|e| DeviceError::EventError(e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_nvml_error() {
        assert!(map_nvml_error("GPU-a", NvmlError::NotSupported).is_not_supported());
        assert!(matches!(
            map_nvml_error("GPU-a", NvmlError::NotFound),
            DeviceError::DeviceNotFound(_)
        ));
        assert!(matches!(
            map_nvml_error("GPU-a", NvmlError::Unknown),
            DeviceError::EventError(_)
        ));
    }
}
