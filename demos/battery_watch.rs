//! Scan for nearby devices and read the battery level of the first one found.
//!
//! Run with: cargo run --example battery_watch

use band_watcher_ble::{DeviceManager, Result, SessionEvent, WatcherConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("band_watcher_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for BLE devices...\n");

    let config = WatcherConfig::default().with_scan_timeout(Some(Duration::from_secs(10)));
    let manager = DeviceManager::with_config(config).await?;

    // Register callback for discovered devices
    let _handle = manager.on_device_discovered(|index, device| {
        println!("  [{}] {}", index, device);
    });

    manager.start_scanning().await?;

    // Wait for the first device
    let device = loop {
        if let Some(device) = manager.devices().into_iter().next() {
            break device;
        }
        if !manager.is_scanning() {
            println!("No devices found.");
            manager.shutdown().await?;
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };

    println!("\nConnecting to {}...", device);

    // Print session progress
    let mut sessions = manager.subscribe_sessions();
    tokio::spawn(async move {
        while let Ok(event) = sessions.recv().await {
            match event {
                SessionEvent::StateChanged { state, .. } => println!("  state: {}", state),
                SessionEvent::ServicesDiscovered { services, .. } => {
                    for uuid in services {
                        println!("  service: {}", uuid);
                    }
                }
                _ => {}
            }
        }
    });

    match manager.read_battery(&device.address).await {
        Ok(result) => match result.battery_level() {
            Some(level) => println!("\nBattery level: {}", level),
            None => println!("\nUnexpected value: {:02X?}", result.raw_bytes.as_ref()),
        },
        Err(e) => println!("\nReading battery failed: {}", e),
    }

    if let Err(e) = manager.disconnect().await {
        println!("Disconnect: {}", e);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    manager.shutdown().await?;
    Ok(())
}
