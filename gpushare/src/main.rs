//! gpushare
//!
//! Kubernetes device plugin core for fractional GPU sharing. Runs as a
//! DaemonSet on GPU nodes, advertises every physical GPU as several virtual
//! devices and withdraws the shares of GPUs that report critical XID errors.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::{Config, HealthConfig};
use gpushare_core::device::{
    create_device_interface, DeviceInterface, DeviceType as CoreDeviceType,
};
use gpushare_core::metrics::MetricsRegistry;
use gpushare_core::partition::{partition, Health};
use gpushare_core::{DeviceAdvertiser, HealthMonitor, MonitorConfig, ShareDegree};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Convert config device type to core device type
fn to_core_device_type(dt: config::DeviceType) -> CoreDeviceType {
    match dt {
        config::DeviceType::Auto => CoreDeviceType::Auto,
        config::DeviceType::Nvidia => CoreDeviceType::Nvidia,
        config::DeviceType::Mock => CoreDeviceType::Mock,
    }
}

/// Convert config health section to the monitor configuration
fn to_core_monitor_config(health: &HealthConfig) -> MonitorConfig {
    MonitorConfig {
        wait_timeout: health.event_wait_timeout,
        benign_xids: health.benign_xids.clone(),
    }
}

/// Partition the node's GPUs, advertise them and watch their health until shutdown
async fn run(
    config: Config,
    share_degree: ShareDegree,
    device: Arc<dyn DeviceInterface>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let devices = partition(device.as_ref(), share_degree)
        .await
        .context("Failed to enumerate GPU devices")?;

    if devices.is_empty() {
        warn!("No GPU devices found on this node");
    }

    let metrics = MetricsRegistry::new();
    metrics.set_device_counts(devices.len() / share_degree.get() as usize, devices.len());

    if config.metrics.enabled {
        let port = config.metrics.port;
        let path = config.metrics.path.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, path).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let advertiser = DeviceAdvertiser::new(devices.clone());

    // Stand-in for the kubelet's ListAndWatch stream
    let mut snapshots = Box::pin(advertiser.list_and_watch());
    tokio::spawn(async move {
        while let Some(list) = snapshots.next().await {
            let unhealthy = list.iter().filter(|d| d.health == Health::Unhealthy).count();
            info!(
                total = list.len(),
                unhealthy = unhealthy,
                "Advertised device list updated"
            );
        }
    });

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let monitor = HealthMonitor::new(device, to_core_monitor_config(&config.health)).spawn(
        shutdown_rx.clone(),
        devices,
        updates_tx,
    );

    advertiser.run(updates_rx, shutdown_rx).await;

    monitor
        .await
        .context("Health monitor task panicked")?
        .context("Health monitor failed")?;

    info!("gpushare shutdown complete");
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16, path: String) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, path = %path, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let path = path.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let requested = request.split_whitespace().nth(1).unwrap_or("");

            let response = if requested == path {
                let body = prometheus::TextEncoder::new()
                    .encode_to_string(&prometheus::gather())
                    .unwrap_or_default();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
            };

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "gpushare starting");

    // Load configuration
    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    let share_degree = config.share_degree(cli.share_degree.as_deref());
    info!(share_degree = %share_degree, "Configuration loaded");

    let device = create_device_interface(to_core_device_type(config.device_type))
        .context("Failed to create device interface")?;

    if cli.once {
        let devices = partition(device.as_ref(), share_degree)
            .await
            .context("Failed to enumerate GPU devices")?;
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    // Run main loop
    run(config, share_degree, device, shutdown_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monitor_config_from_health() {
        let health = HealthConfig {
            benign_xids: vec![13],
            event_wait_timeout: Duration::from_millis(250),
        };
        let monitor = to_core_monitor_config(&health);
        assert_eq!(monitor.benign_xids, vec![13]);
        assert_eq!(monitor.wait_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_device_type_mapping() {
        assert_eq!(to_core_device_type(config::DeviceType::Mock), CoreDeviceType::Mock);
        assert_eq!(to_core_device_type(config::DeviceType::Nvidia), CoreDeviceType::Nvidia);
        assert_eq!(to_core_device_type(config::DeviceType::Auto), CoreDeviceType::Auto);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut cfg = Config::default();
        cfg.device_type = config::DeviceType::Mock;
        cfg.metrics.enabled = false;
        cfg.health.event_wait_timeout = Duration::from_millis(10);

        let device = create_device_interface(CoreDeviceType::Mock).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(cfg, ShareDegree::new(2), device, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
