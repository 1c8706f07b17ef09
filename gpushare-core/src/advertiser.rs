//! Advertised device list
//!
//! Owns the authoritative list of virtual devices handed to the kubelet,
//! applies health updates coming from the monitor and publishes each new
//! snapshot for ListAndWatch.

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::metrics::MetricsRegistry;
use crate::partition::{Health, VirtualDevice};

/// Authoritative advertised device list
pub struct DeviceAdvertiser {
    devices: watch::Sender<Vec<VirtualDevice>>,
    metrics: MetricsRegistry,
}

impl DeviceAdvertiser {
    /// Create an advertiser for the partitioned device list
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        let (tx, _rx) = watch::channel(devices);
        let advertiser = Self {
            devices: tx,
            metrics: MetricsRegistry::new(),
        };
        advertiser.metrics.set_unhealthy_devices(advertiser.unhealthy_count());
        advertiser
    }

    /// Current snapshot
    pub fn devices(&self) -> Vec<VirtualDevice> {
        self.devices.borrow().clone()
    }

    /// Whether `id` is one of the advertised devices
    pub fn contains(&self, id: &str) -> bool {
        self.devices.borrow().iter().any(|d| d.id == id)
    }

    /// Number of devices currently reported unhealthy
    pub fn unhealthy_count(&self) -> usize {
        self.devices
            .borrow()
            .iter()
            .filter(|d| d.health == Health::Unhealthy)
            .count()
    }

    /// Receiver of list snapshots
    pub fn subscribe(&self) -> watch::Receiver<Vec<VirtualDevice>> {
        self.devices.subscribe()
    }

    /// The current list, then one list per change; ends when the advertiser is dropped
    pub fn list_and_watch(&self) -> impl Stream<Item = Vec<VirtualDevice>> + Send + 'static {
        let rx = self.devices.subscribe();
        futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, (rx, false)))
        })
    }

    /// Apply one health update. Returns whether the advertised list changed.
    pub fn apply_update(&self, update: &VirtualDevice) -> bool {
        let changed = self.devices.send_if_modified(|list| {
            match list.iter_mut().find(|d| d.id == update.id) {
                Some(device) if device.health != update.health => {
                    device.health = update.health;
                    true
                }
                Some(_) => false,
                None => {
                    warn!(device = %update, "Health update for a device that is not advertised");
                    false
                }
            }
        });

        if changed {
            self.metrics.set_unhealthy_devices(self.unhealthy_count());
        }
        changed
    }

    /// Drain health updates until shutdown or until the monitor hangs up
    pub async fn run(
        &self,
        mut updates: mpsc::UnboundedReceiver<VirtualDevice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(device) => {
                        if self.apply_update(&device) {
                            info!(device = %device, health = %device.health, "Device health changed");
                        } else {
                            debug!(device = %device, "Duplicate health update");
                        }
                    }
                    None => {
                        info!("Health update channel closed, stopping advertiser");
                        break;
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping advertiser");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn advertiser() -> DeviceAdvertiser {
        DeviceAdvertiser::new(vec![
            VirtualDevice::new("GPU-a", 1),
            VirtualDevice::new("GPU-a", 2),
            VirtualDevice::new("GPU-b", 1),
        ])
    }

    #[test]
    fn test_contains() {
        let adv = advertiser();
        assert!(adv.contains("GPU-a-002"));
        assert!(!adv.contains("GPU-a-003"));
        assert!(!adv.contains("GPU-a"));
    }

    #[test]
    fn test_apply_update() {
        let adv = advertiser();
        let update = VirtualDevice::new("GPU-a", 2).unhealthy();

        assert!(adv.apply_update(&update));
        assert!(!adv.apply_update(&update));
        assert_eq!(adv.unhealthy_count(), 1);

        let devices = adv.devices();
        assert_eq!(devices[1].health, Health::Unhealthy);
        assert_eq!(devices[0].health, Health::Healthy);
        assert_eq!(devices.len(), 3);
    }

    #[test]
    fn test_unknown_update_ignored() {
        let adv = advertiser();
        assert!(!adv.apply_update(&VirtualDevice::new("GPU-x", 1).unhealthy()));
        assert_eq!(adv.unhealthy_count(), 0);
    }

    #[test]
    fn test_snapshot_json() {
        let adv = advertiser();
        adv.apply_update(&VirtualDevice::new("GPU-b", 1).unhealthy());
        let json = serde_json::to_value(adv.devices()).unwrap();
        assert_eq!(json[2]["ID"], "GPU-b-001");
        assert_eq!(json[2]["Health"], "Unhealthy");
        assert_eq!(json[0]["Health"], "Healthy");
    }

    #[tokio::test]
    async fn test_run_drains_updates() {
        let adv = advertiser();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(VirtualDevice::new("GPU-a", 1).unhealthy()).unwrap();
        tx.send(VirtualDevice::new("GPU-a", 2).unhealthy()).unwrap();
        tx.send(VirtualDevice::new("GPU-a", 1).unhealthy()).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), adv.run(rx, shutdown_rx))
            .await
            .expect("advertiser did not stop");

        assert_eq!(adv.unhealthy_count(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let adv = advertiser();
        let (_tx, rx) = mpsc::unbounded_channel::<VirtualDevice>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), adv.run(rx, shutdown_rx))
            .await
            .expect("advertiser did not stop");
    }

    #[tokio::test]
    async fn test_list_and_watch() {
        let adv = advertiser();
        let mut stream = Box::pin(adv.list_and_watch());

        let first = stream.next().await.unwrap();
        assert!(first.iter().all(|d| d.health == Health::Healthy));

        adv.apply_update(&VirtualDevice::new("GPU-b", 1).unhealthy());
        let second = stream.next().await.unwrap();
        assert_eq!(second[2].health, Health::Unhealthy);

        drop(adv);
        assert!(stream.next().await.is_none());
    }
}
