//! XID health monitor
//!
//! Subscribes to critical XID events for every physical GPU behind the
//! advertised virtual devices and reports each affected share as unhealthy on
//! an outgoing channel.
//!
//! Lifecycle: Running → Stopped, only through the shutdown signal, which is
//! checked before every bounded wait. A reported device never becomes healthy
//! again from here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::device::{
    describe_xid, DeviceError, DeviceInterface, FaultEvent, FaultKind, FaultSubscription,
};
use crate::metrics::{FaultScope, MetricsRegistry};
use crate::partition::VirtualDevice;

/// XIDs caused by applications; the GPU itself stays healthy.
/// See <https://docs.nvidia.com/deploy/xid-errors/index.html>.
pub const DEFAULT_BENIGN_XIDS: [u64; 3] = [31, 43, 45];

/// Upper bound on a single event wait, and so on shutdown latency
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// How long one wait for an event may block
    pub wait_timeout: Duration,
    /// XID codes that never mark a device unhealthy
    pub benign_xids: Vec<u64>,
}

impl MonitorConfig {
    /// Whether an XID code is on the application-error allow-list
    pub fn is_benign(&self, xid: u64) -> bool {
        self.benign_xids.contains(&xid)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            benign_xids: DEFAULT_BENIGN_XIDS.to_vec(),
        }
    }
}

/// Conditions that stop the monitor and should stop the process
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Could not create the event subscription
    #[error("Failed to open XID event subscription: {0}")]
    Subscribe(#[source] DeviceError),

    /// Registration failed for a reason other than "not supported"
    #[error("Failed to register {uuid} for XID events: {source}")]
    Registration {
        uuid: String,
        #[source]
        source: DeviceError,
    },

    /// Nobody is consuming health updates any more
    #[error("Health update channel closed")]
    ChannelClosed,
}

/// What a single event means for the monitored devices
#[derive(Debug, PartialEq, Eq)]
enum Reaction<'e> {
    /// Not a critical XID event
    Skip,
    /// Application error, device still healthy
    Benign(u64),
    /// No device named, every device is affected
    AllDevices,
    /// One physical device is affected
    Device(&'e str),
}

/// Health monitor
pub struct HealthMonitor {
    device: Arc<dyn DeviceInterface>,
    config: MonitorConfig,
    metrics: MetricsRegistry,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(device: Arc<dyn DeviceInterface>, config: MonitorConfig) -> Self {
        Self {
            device,
            config,
            metrics: MetricsRegistry::new(),
        }
    }

    /// Run [`HealthMonitor::watch`] on the blocking pool
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
        devices: Vec<VirtualDevice>,
        updates: mpsc::UnboundedSender<VirtualDevice>,
    ) -> JoinHandle<Result<(), MonitorError>> {
        tokio::task::spawn_blocking(move || self.watch(&shutdown, &devices, &updates))
    }

    /// Register every physical device and process events until shutdown.
    ///
    /// Blocks the calling thread. The subscription is released on every exit
    /// path. `Ok(())` is returned only after the shutdown signal fired.
    pub fn watch(
        &self,
        shutdown: &watch::Receiver<bool>,
        devices: &[VirtualDevice],
        updates: &mpsc::UnboundedSender<VirtualDevice>,
    ) -> Result<(), MonitorError> {
        let mut subscription = self.device.subscribe().map_err(MonitorError::Subscribe)?;

        let result = self
            .register_all(subscription.as_mut(), devices, updates)
            .and_then(|()| self.event_loop(subscription.as_mut(), shutdown, devices, updates));

        if let Err(e) = subscription.release() {
            warn!(error = %e, "Failed to release XID event subscription");
        }

        match result {
            // The consumer stops first on shutdown
            Err(MonitorError::ChannelClosed) if is_cancelled(shutdown) => {
                info!("Health update channel closed during shutdown");
                Ok(())
            }
            other => other,
        }
    }

    fn register_all(
        &self,
        subscription: &mut dyn FaultSubscription,
        devices: &[VirtualDevice],
        updates: &mpsc::UnboundedSender<VirtualDevice>,
    ) -> Result<(), MonitorError> {
        let mut seen = HashSet::new();

        for uuid in devices.iter().filter_map(VirtualDevice::physical_uuid) {
            if !seen.insert(uuid) {
                continue;
            }

            match subscription.register(uuid) {
                Ok(()) => {}
                Err(e) if e.is_not_supported() => {
                    warn!(
                        uuid = uuid,
                        error = %e,
                        "GPU is too old to support health checking, marking it unhealthy"
                    );
                    self.metrics.inc_fault_event(None, FaultScope::Unsupported);
                    self.emit_for(uuid, devices, updates)?;
                }
                Err(source) => {
                    return Err(MonitorError::Registration {
                        uuid: uuid.to_string(),
                        source,
                    });
                }
            }
        }

        info!(
            physical = seen.len(),
            wait_timeout = %humantime::format_duration(self.config.wait_timeout),
            "Watching for critical XID events"
        );
        Ok(())
    }

    fn event_loop(
        &self,
        subscription: &mut dyn FaultSubscription,
        shutdown: &watch::Receiver<bool>,
        devices: &[VirtualDevice],
        updates: &mpsc::UnboundedSender<VirtualDevice>,
    ) -> Result<(), MonitorError> {
        loop {
            if is_cancelled(shutdown) {
                info!("Shutdown signal received, stopping health monitor");
                return Ok(());
            }

            let event = match subscription.wait(self.config.wait_timeout) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "Waiting for XID event failed");
                    // Keep shutdown latency bounded without spinning on a
                    // persistently failing wait.
                    std::thread::sleep(self.config.wait_timeout);
                    continue;
                }
            };

            self.handle_event(&event, devices, updates)?;
        }
    }

    fn classify<'e>(&self, event: &'e FaultEvent) -> Reaction<'e> {
        if event.kind != FaultKind::CriticalXid {
            return Reaction::Skip;
        }
        if let Some(xid) = event.xid.filter(|x| self.config.is_benign(*x)) {
            return Reaction::Benign(xid);
        }
        match event.target_uuid() {
            None => Reaction::AllDevices,
            Some(uuid) => Reaction::Device(uuid),
        }
    }

    fn handle_event(
        &self,
        event: &FaultEvent,
        devices: &[VirtualDevice],
        updates: &mpsc::UnboundedSender<VirtualDevice>,
    ) -> Result<(), MonitorError> {
        let description = event.xid.map(describe_xid).unwrap_or("no error data");

        match self.classify(event) {
            Reaction::Skip => {
                trace!(kind = ?event.kind, "Ignoring non-critical event");
                Ok(())
            }
            Reaction::Benign(xid) => {
                debug!(xid, description, "Ignoring application XID error");
                self.metrics.inc_ignored_event(xid);
                Ok(())
            }
            Reaction::AllDevices => {
                warn!(
                    xid = ?event.xid,
                    description,
                    observed_at = %event.observed_at,
                    "Critical XID error without device, marking all devices unhealthy"
                );
                self.metrics.inc_fault_event(event.xid, FaultScope::All);
                for device in devices {
                    emit(updates, device)?;
                }
                Ok(())
            }
            Reaction::Device(uuid) => {
                warn!(
                    uuid = uuid,
                    xid = ?event.xid,
                    description,
                    observed_at = %event.observed_at,
                    "Critical XID error, marking device unhealthy"
                );
                self.metrics.inc_fault_event(event.xid, FaultScope::Device);
                self.emit_for(uuid, devices, updates)
            }
        }
    }

    /// Emit every share of the physical device `uuid`
    fn emit_for(
        &self,
        uuid: &str,
        devices: &[VirtualDevice],
        updates: &mpsc::UnboundedSender<VirtualDevice>,
    ) -> Result<(), MonitorError> {
        let mut matched = 0;
        for device in devices.iter().filter(|d| d.physical_uuid() == Some(uuid)) {
            emit(updates, device)?;
            matched += 1;
        }
        if matched == 0 {
            debug!(uuid = uuid, "XID event for a device that is not advertised");
        }
        Ok(())
    }
}

/// Shutdown fired, or its sender is gone
fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    let fired = *shutdown.borrow();
    fired || shutdown.has_changed().is_err()
}

fn emit(
    updates: &mpsc::UnboundedSender<VirtualDevice>,
    device: &VirtualDevice,
) -> Result<(), MonitorError> {
    updates
        .send(device.unhealthy())
        .map_err(|_| MonitorError::ChannelClosed)
}
