//! Prometheus metrics for gpushare

use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

/// Number of physical GPUs enumerated at startup
static PHYSICAL_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("gpushare_physical_devices", "GPUs detected"))
        .expect("Failed to create physical_devices metric")
});

/// Number of virtual devices advertised
static VIRTUAL_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("gpushare_virtual_devices", "GPU shares advertised"))
        .expect("Failed to create virtual_devices metric")
});

/// Number of virtual devices currently reported unhealthy
static UNHEALTHY_DEVICES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gpushare_unhealthy_virtual_devices",
        "Number of virtual GPU shares reported unhealthy"
    ))
    .expect("Failed to create unhealthy_virtual_devices metric")
});

/// Fault events that marked devices unhealthy
static FAULT_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpushare_fault_events_total",
            "Total number of critical fault events acted upon"
        ),
        &["xid", "scope"]
    )
    .expect("Failed to create fault_events metric")
});

/// Fault events ignored as application errors
static IGNORED_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpushare_ignored_fault_events_total",
            "Total number of fault events ignored as application errors"
        ),
        &["xid"]
    )
    .expect("Failed to create ignored_fault_events metric")
});

/// Scope label for a fault event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    /// Event named one physical device
    Device,
    /// Event applied to every device
    All,
    /// Registration reported "not supported"
    Unsupported,
}

impl FaultScope {
    fn as_str(self) -> &'static str {
        match self {
            FaultScope::Device => "device",
            FaultScope::All => "all",
            FaultScope::Unsupported => "unsupported",
        }
    }
}

fn xid_label(xid: Option<u64>) -> String {
    xid.map(|x| x.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Metrics registry wrapper
#[derive(Debug, Clone, Copy)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*PHYSICAL_DEVICES;
        let _ = &*VIRTUAL_DEVICES;
        let _ = &*UNHEALTHY_DEVICES;
        let _ = &*FAULT_EVENTS;
        let _ = &*IGNORED_EVENTS;
        Self
    }

    /// Set physical and virtual device counts
    pub fn set_device_counts(&self, physical: usize, virtual_devices: usize) {
        PHYSICAL_DEVICES.set(physical as i64);
        VIRTUAL_DEVICES.set(virtual_devices as i64);
    }

    /// Set the number of unhealthy virtual devices
    pub fn set_unhealthy_devices(&self, count: usize) {
        UNHEALTHY_DEVICES.set(count as i64);
    }

    /// Increment the acted-upon fault counter
    pub fn inc_fault_event(&self, xid: Option<u64>, scope: FaultScope) {
        FAULT_EVENTS
            .with_label_values(&[&xid_label(xid), scope.as_str()])
            .inc();
    }

    /// Increment the ignored fault counter
    pub fn inc_ignored_event(&self, xid: u64) {
        IGNORED_EVENTS.with_label_values(&[&xid.to_string()]).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
