/// Supervisory Bridge
///
/// Polls the field controller's register interface and relays status and
/// commands to a single operator connection (newline-delimited JSON).
///
/// Usage: supervisory_bridge [config.json]

use std::sync::Arc;
use tokio::signal;
use log::{error, info};

use stepper_cell::{config, console_sink, BridgeConfig, SupervisoryBridge};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("🌉 {}", stepper_cell::info());
    println!("==== Supervisory Bridge ====");

    let config: BridgeConfig = match std::env::args().nth(1) {
        Some(path) => config::load_json(path)?,
        None => BridgeConfig::default(),
    };

    info!("Controller: {} (unit {})", config.controller.address, config.controller_unit_id);
    info!("Operator listener: {}", config.operator_bind_address);

    let bridge = Arc::new(SupervisoryBridge::new(config, console_sink!()));

    tokio::select! {
        result = bridge.clone().run() => {
            if let Err(e) = result {
                error!("❌ Bridge stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            let status = bridge.status_snapshot();
            info!(
                "🛑 Shutting down: {} status updates, {} commands forwarded",
                status.status_updates, status.commands_forwarded
            );
        }
    }

    Ok(())
}
