//! Mock device implementation for testing

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DeviceError, DeviceInterface, DeviceType, FaultEvent, FaultSubscription, PhysicalDevice,
};

/// Scripted fault state shared between a mock device and its subscriptions
#[derive(Default)]
struct MockFaults {
    events: Mutex<VecDeque<FaultEvent>>,
    unsupported: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    registered: Mutex<Vec<String>>,
    released: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock device for testing
pub struct MockDevice {
    devices: Vec<PhysicalDevice>,
    faults: Arc<MockFaults>,
    /// Configurable enumeration failure simulation
    pub fail_list_devices: AtomicBool,
}

impl MockDevice {
    /// Create a new mock device with default 2 GPUs
    pub fn new() -> Self {
        Self::with_device_count(2)
    }

    /// Create a mock device with specified number of GPUs
    pub fn with_device_count(count: u32) -> Self {
        let uuids: Vec<String> = (0..count).map(|i| format!("GPU-MOCK-{:04}", i)).collect();
        Self::with_uuids(&uuids)
    }

    /// Create a mock device with the given uuids, in enumeration order
    pub fn with_uuids<S: AsRef<str>>(uuids: &[S]) -> Self {
        let devices = uuids
            .iter()
            .enumerate()
            .map(|(i, uuid)| PhysicalDevice {
                index: i as u32,
                uuid: uuid.as_ref().to_string(),
                name: format!("Mock GPU {}", i),
            })
            .collect();

        Self {
            devices,
            faults: Arc::new(MockFaults::default()),
            fail_list_devices: AtomicBool::new(false),
        }
    }

    /// Set whether enumeration should fail
    pub fn set_fail_list_devices(&self, fail: bool) {
        self.fail_list_devices.store(fail, Ordering::SeqCst);
    }

    /// Queue an event for delivery to subscriptions
    pub fn push_event(&self, event: FaultEvent) {
        lock(&self.faults.events).push_back(event);
    }

    /// Number of queued events not yet delivered
    pub fn pending_events(&self) -> usize {
        lock(&self.faults.events).len()
    }

    /// Make registration for `uuid` report "not supported"
    pub fn mark_unsupported(&self, uuid: &str) {
        lock(&self.faults.unsupported).insert(uuid.to_string());
    }

    /// Make registration for `uuid` fail with a hard error
    pub fn fail_registration(&self, uuid: &str) {
        lock(&self.faults.failing).insert(uuid.to_string());
    }

    /// Every registration attempt seen so far, in order
    pub fn registrations(&self) -> Vec<String> {
        lock(&self.faults.registered).clone()
    }

    /// Whether a subscription has been released
    pub fn is_released(&self) -> bool {
        self.faults.released.load(Ordering::SeqCst)
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInterface for MockDevice {
    async fn list_devices(&self) -> Result<Vec<PhysicalDevice>, DeviceError> {
        if self.fail_list_devices.load(Ordering::SeqCst) {
            return Err(DeviceError::QueryError(
                "Mock enumeration failure".to_string(),
            ));
        }
        Ok(self.devices.clone())
    }

    fn subscribe(&self) -> Result<Box<dyn FaultSubscription>, DeviceError> {
        Ok(Box::new(MockSubscription {
            faults: self.faults.clone(),
            active: Vec::new(),
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Mock
    }
}

struct MockSubscription {
    faults: Arc<MockFaults>,
    /// Devices whose events this subscription delivers
    active: Vec<String>,
}

impl MockSubscription {
    /// Behaves like NVML: a failed registration drops the whole event set,
    /// which is then rebuilt from the devices registered before it
    fn rebuild(&mut self) {
        let previous = std::mem::take(&mut self.active);
        self.active.extend(previous);
    }

    fn delivers(&self, event: &FaultEvent) -> bool {
        match event.target_uuid() {
            None => true,
            Some(uuid) => self.active.iter().any(|u| u == uuid),
        }
    }
}

impl FaultSubscription for MockSubscription {
    fn register(&mut self, uuid: &str) -> Result<(), DeviceError> {
        lock(&self.faults.registered).push(uuid.to_string());

        if lock(&self.faults.unsupported).contains(uuid) {
            self.rebuild();
            return Err(DeviceError::NotSupported(uuid.to_string()));
        }
        if lock(&self.faults.failing).contains(uuid) {
            self.rebuild();
            return Err(DeviceError::EventError(format!(
                "Mock registration failure for {}",
                uuid
            )));
        }
        self.active.push(uuid.to_string());
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<FaultEvent>, DeviceError> {
        let next = lock(&self.faults.events).pop_front();
        match next {
            Some(event) if self.delivers(&event) => Ok(Some(event)),
            // Events for devices outside the set are never delivered
            Some(_) => Ok(None),
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn release(self: Box<Self>) -> Result<(), DeviceError> {
        self.faults.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_mock_device_list() {
        let mock = MockDevice::with_device_count(4);
        let devices = mock.list_devices().await.unwrap();
        assert_eq!(devices.len(), 4);
        assert_eq!(devices[3].uuid, "GPU-MOCK-0003");
    }

    #[tokio::test]
    async fn test_mock_list_failure() {
        let mock = MockDevice::new();
        mock.set_fail_list_devices(true);
        assert_err!(mock.list_devices().await);
    }

    #[test]
    fn test_mock_registration() {
        let mock = MockDevice::with_uuids(&["GPU-a", "GPU-b", "GPU-c"]);
        mock.mark_unsupported("GPU-b");
        mock.fail_registration("GPU-c");

        let mut sub = mock.subscribe().unwrap();
        assert_ok!(sub.register("GPU-a"));
        assert!(sub.register("GPU-b").unwrap_err().is_not_supported());
        assert!(!sub.register("GPU-c").unwrap_err().is_not_supported());
        assert_eq!(mock.registrations(), vec!["GPU-a", "GPU-b", "GPU-c"]);
    }

    #[test]
    fn test_mock_wait_and_release() {
        let mock = MockDevice::new();
        mock.push_event(FaultEvent::critical_xid(Some("GPU-MOCK-0000"), 79));

        let mut sub = mock.subscribe().unwrap();
        sub.register("GPU-MOCK-0000").unwrap();
        let event = sub.wait(Duration::from_millis(1)).unwrap();
        assert_eq!(event.unwrap().xid, Some(79));
        assert!(sub.wait(Duration::from_millis(1)).unwrap().is_none());
        assert_eq!(mock.pending_events(), 0);

        assert!(!mock.is_released());
        sub.release().unwrap();
        assert!(mock.is_released());
    }

    #[test]
    fn test_mock_failed_registration_keeps_earlier_devices() {
        let mock = MockDevice::with_uuids(&["GPU-a", "GPU-b", "GPU-c"]);
        mock.mark_unsupported("GPU-b");
        mock.push_event(FaultEvent::critical_xid(Some("GPU-a"), 79));
        mock.push_event(FaultEvent::critical_xid(Some("GPU-b"), 79));
        mock.push_event(FaultEvent::critical_xid(Some("GPU-c"), 48));

        let mut sub = mock.subscribe().unwrap();
        assert_ok!(sub.register("GPU-a"));
        assert_err!(sub.register("GPU-b"));
        assert_ok!(sub.register("GPU-c"));

        let timeout = Duration::from_millis(1);
        let first = sub.wait(timeout).unwrap().unwrap();
        assert_eq!(first.target_uuid(), Some("GPU-a"));
        // GPU-b never made it into the set
        assert!(sub.wait(timeout).unwrap().is_none());
        let third = sub.wait(timeout).unwrap().unwrap();
        assert_eq!(third.target_uuid(), Some("GPU-c"));
        assert_eq!(third.xid, Some(48));
    }
}
