use tracing::{error, info, warn};
use cgmlink::{protocol::to_hex, CgmClient, CgmEvent, ConnectionState, Result, SupervisorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🩸 CGM Glucose Stream Example");
    info!("Press Ctrl+C to stop");

    let (client, mut events) = match CgmClient::with_btleplug(SupervisorConfig::default()).await {
        Ok(started) => started,
        Err(e) => {
            error!("❌ Failed to open Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    client.start_scan()?;
    let mut readings = 0u32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Event stream ended");
                    break;
                };

                match event {
                    CgmEvent::DeviceFound(device) => {
                        if client.state() == ConnectionState::Scanning {
                            info!(
                                "📡 Connecting to {} ({} dBm)",
                                device.display_name(),
                                device.rssi
                            );
                            client.connect_to_device(device)?;
                        }
                    }
                    CgmEvent::ScanCountdown { remaining_secs } => {
                        info!("⏳ {}s of scanning left", remaining_secs);
                    }
                    CgmEvent::StateChanged(state) => info!("🔄 {}", state),
                    CgmEvent::Measurement(measurement) => {
                        readings += 1;
                        match measurement.glucose {
                            Some(glucose) => println!("🩸 {glucose:.0} mg/dL  ({measurement})"),
                            None => println!("🩸 unreadable record ({measurement})"),
                        }
                    }
                    CgmEvent::CharacteristicValue { characteristic, value } => {
                        println!("📋 {}: {}", characteristic, to_hex(&value));
                    }
                    CgmEvent::ControlPointResponse(response) => {
                        println!("🎛️  Control point: {response}");
                    }
                    CgmEvent::Log(line) => println!("   {line}"),
                    CgmEvent::ScanningChanged(_) | CgmEvent::ConnectionChanged(_) => {}
                }
            }
        }
    }

    client.closed().await;
    info!("✅ Closed after {} readings", readings);
    Ok(())
}
