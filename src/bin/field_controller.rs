/// Field Controller
///
/// Polls the sensor, drive and pulse counter on the serial bus, serves the
/// controller's register interface over Modbus TCP and runs the automatic
/// cycle.
///
/// Usage: field_controller [config.json]

use std::sync::Arc;
use tokio::signal;
use log::{error, info};

use stepper_cell::{config, console_sink, ControllerConfig, FieldController, SerialTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("🔧 {}", stepper_cell::info());
    println!("==== Field Controller ====");

    let config: ControllerConfig = match std::env::args().nth(1) {
        Some(path) => config::load_json(path)?,
        None => ControllerConfig::default(),
    };
    config.validate()?;

    info!("Serial bus: {} @ {} baud", config.serial.port, config.serial.baud_rate);
    info!("Register interface: {}", config.bind_address);
    info!(
        "Nodes: sensor={}, drive={}, counter={}",
        config.nodes.sensor, config.nodes.drive, config.nodes.counter
    );

    let events = console_sink!();
    let transport = Arc::new(SerialTransport::new(config.serial.clone()).with_packet_logging(events.clone()));
    let controller = Arc::new(FieldController::new(config, transport, events));

    tokio::select! {
        result = controller.clone().run() => {
            if let Err(e) = result {
                error!("❌ Controller stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("🛑 Shutting down, last state: {}", controller.state().await);
        }
    }

    Ok(())
}
