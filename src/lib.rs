//! # Stepper Cell - Modbus Supervision for a Stepper-Motor Positioning Cell
//!
//! Three tiers cooperate to run a stepper drive, a temperature/humidity
//! sensor and a pulse counter:
//!
//! - the **field controller** polls the devices over a serial Modbus RTU bus,
//!   runs the automatic count-then-move cycle and exposes its state through
//!   its own Modbus TCP register interface;
//! - the **supervisory bridge** polls that interface, pushes JSON status to a
//!   remote operator and turns operator commands back into register writes;
//! - the **virtual slave** stands in for the field hardware, either over TCP
//!   or as an RTU simulator on a serial link.
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Field bus | Register interface |
//! |------|----------|-----------|--------------------|
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stepper_cell::{CellResult, ControllerConfig, EventSink, FieldController, SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> CellResult<()> {
//!     let config = ControllerConfig::default();
//!     let transport = Arc::new(SerialTransport::new(config.serial.clone()));
//!     let controller = Arc::new(FieldController::new(config, transport, EventSink::default()));
//!     controller.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   JSON lines   ┌─────────────────┐
//! │  Operator tier  │◄──────────────►│ Supervisory     │
//! └─────────────────┘                │ bridge          │
//!                                    └─────────────────┘
//!                                             │ Modbus TCP
//!                                    ┌─────────────────┐
//!                                    │ Field controller│
//!                                    │ (register bank) │
//!                                    └─────────────────┘
//!                                             │ Modbus RTU
//!                 ┌──────────────┬────────────┴─┬──────────────┐
//!                 │ Sensor (1)   │ Drive (2)    │ Counter (3)  │
//!                 └──────────────┴──────────────┴──────────────┘
//! ```

/// Error taxonomy shared by every layer
pub mod error;

/// Modbus RTU checksum
pub mod checksum;

/// Frame encoding and decoding for the serial and TCP encapsulations
pub mod protocol;

/// Serial and TCP transaction managers
pub mod transport;

/// Thread-safe register storage for one field node
pub mod register_bank;

/// Modbus TCP virtual slave
pub mod server;

/// Sensor, drive and pulse counter
pub mod device;

/// In-memory field hardware on the RTU side
pub mod simulator;

/// Automatic cycle and manual command dispatch
pub mod controller;

/// Link between the controller and the operator tier
pub mod bridge;

/// Control surface for presentation layers
pub mod facade;

pub mod config;

/// Leveled event sink
pub mod logging;

/// Validation, formatting and timing helpers
pub mod utils;

// Re-export main types for convenience
pub use bridge::{BridgeStatus, OperatorCommand, SupervisoryBridge};
pub use config::{BridgeConfig, ControllerConfig, FrameTiming, NodeIds, SerialConfig, TcpClientConfig};
pub use controller::{AutoState, CommandCode, CommandPacket, CommandSource, ControllerSnapshot, FieldController};
pub use device::{CounterReading, Drive, DriveStatus, FieldDevice, PulseCounter, Sensor, SensorReading};
pub use error::{CellError, CellResult};
pub use facade::{CellFacade, JogDirection};
pub use logging::{EventSink, LogEvent, LogLevel};
pub use protocol::{Framing, ModbusRequest, ModbusResponse};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use server::{ModbusServer, NodeBanks, ServerStats, VirtualSlaveConfig, VirtualSlaveServer};
pub use simulator::FieldSimulator;
pub use transport::{FieldTransport, SerialTransport, TcpTransport, TransportStats};
pub use utils::OperationTimer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Stepper Cell v{} - field controller, supervisory bridge and virtual slave", VERSION)
}
