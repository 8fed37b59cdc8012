/// Virtual Slave
///
/// Stands in for the sensor, drive and pulse counter so the controller can
/// run without hardware.
///
/// Usage:
///   virtual_slave tcp [bind_address]       serve the devices over Modbus TCP
///   virtual_slave rtu <serial_port> [baud] answer Modbus RTU on a serial line
///
/// The simulated drive moves, the counter counts up toward its target and the
/// sensor drifts slightly on every step.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;
use log::{error, info};

use stepper_cell::{
    transport, FieldSimulator, ModbusServer, NodeIds, SerialConfig, VirtualSlaveConfig, VirtualSlaveServer,
};

const STEP_INTERVAL: Duration = Duration::from_millis(100);

fn usage() {
    eprintln!("Usage:");
    eprintln!("  virtual_slave tcp [bind_address]");
    eprintln!("  virtual_slave rtu <serial_port> [baud]");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("🧪 {}", stepper_cell::info());
    println!("==== Virtual Slave ====");

    let args: Vec<String> = std::env::args().collect();
    let simulator = Arc::new(
        FieldSimulator::new(NodeIds::default())
            .with_counting(true)
            .with_jitter(true),
    );
    tokio::spawn(simulator.clone().run(STEP_INTERVAL));

    let mut server = None;
    match args.get(1).map(String::as_str) {
        Some("tcp") | None => {
            let bind_address = args.get(2).cloned().unwrap_or_else(|| "0.0.0.0:5020".to_string());
            let mut tcp = VirtualSlaveServer::new(
                VirtualSlaveConfig {
                    bind_address,
                    ..VirtualSlaveConfig::default()
                },
                simulator.banks(),
            );
            let addr = tcp.start().await?;
            info!("✅ Serving units {:?} on {}", simulator.banks().unit_ids(), addr);
            server = Some(tcp);
        }
        Some("rtu") => {
            let Some(port) = args.get(2) else {
                usage();
                return Ok(());
            };
            let baud_rate = match args.get(3) {
                Some(baud) => baud.parse()?,
                None => SerialConfig::default().baud_rate,
            };
            let config = SerialConfig {
                port: port.clone(),
                baud_rate,
                ..SerialConfig::default()
            };
            let link = transport::open_serial_port(&config)?;
            info!("✅ Answering Modbus RTU on {} @ {} baud", config.port, config.baud_rate);
            tokio::spawn(simulator.clone().serve_rtu(link));
        }
        Some(_) => {
            usage();
            return Ok(());
        }
    }

    let mut report = interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let stats = simulator.stats();
                let (value, target, done) = simulator.counter();
                info!(
                    "📊 requests={} exceptions={} position={} counter={}/{}{}",
                    stats.requests,
                    stats.exceptions,
                    simulator.drive_position(),
                    value,
                    target,
                    if done { " (done)" } else { "" }
                );
            }
            _ = signal::ctrl_c() => {
                if let Some(mut tcp) = server.take() {
                    if let Err(e) = tcp.stop().await {
                        error!("❌ Stop failed: {}", e);
                    }
                }
                info!("🛑 Virtual slave stopped");
                return Ok(());
            }
        }
    }
}
