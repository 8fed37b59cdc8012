//! Runtime configuration for every tier of the cell.
//!
//! All structures carry defaults matching the reference cell wiring (sensor
//! on node 1, drive on node 2, pulse counter on node 3, controller on port
//! 502, operator link on 5002) and derive serde so a binary can overlay them
//! from a JSON document.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CellError, CellResult};
use crate::utils::validation;

/// Serial response deadline
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Pause between writing a request and the first read
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 20;

/// Quiet gap after the last received chunk that marks a response complete
pub const DEFAULT_SILENCE_WINDOW_MS: u64 = 30;

/// Field controller register interface port
pub const DEFAULT_CONTROLLER_PORT: u16 = 502;

/// Operator tier listening port on the bridge
pub const DEFAULT_OPERATOR_PORT: u16 = 5002;

/// Holding and input register layout of the field controller's own TCP
/// register interface, shared by the controller and the bridge.
pub mod controller_map {
    /// Counter target written by the supervisory tier
    pub const HR_TARGET: u16 = 0;
    /// 0 = automatic, 1 = manual
    pub const HR_MODE: u16 = 8;
    /// Start of the six-register command packet
    pub const HR_COMMAND: u16 = 10;
    pub const COMMAND_LEN: u16 = 6;

    pub const IR_POSITION_HI: u16 = 0;
    pub const IR_POSITION_LO: u16 = 1;
    pub const IR_SPEED: u16 = 2;
    pub const IR_TEMPERATURE: u16 = 3;
    pub const IR_HUMIDITY: u16 = 4;
    pub const IR_STATUS: u16 = 5;
    pub const IR_COUNTER_VALUE: u16 = 6;
    pub const IR_COUNTER_TARGET: u16 = 7;
    pub const IR_AUTO_STATE: u16 = 8;
    pub const IR_MODE: u16 = 9;
    pub const IR_STEP_ENABLED: u16 = 10;
    pub const IR_JOG_STATE: u16 = 11;
    /// Number of mirrored input registers
    pub const STATUS_LEN: u16 = 12;

    /// IR_STATUS bits
    pub const STATUS_ALARM: u16 = 1 << 0;
    pub const STATUS_IN_POSITION: u16 = 1 << 1;
    pub const STATUS_RUNNING: u16 = 1 << 2;
    pub const STATUS_COUNTER_DONE: u16 = 1 << 3;

    pub const MODE_AUTO: u16 = 0;
    pub const MODE_MANUAL: u16 = 1;
}

/// Timing of one fieldbus transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameTiming {
    pub response_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub silence_window_ms: u64,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            silence_window_ms: DEFAULT_SILENCE_WINDOW_MS,
        }
    }
}

impl FrameTiming {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms)
    }

    /// The silence window must fit the 20-50 ms band and stay below the deadline
    pub fn validate(&self) -> CellResult<()> {
        if !(20..=50).contains(&self.silence_window_ms) {
            return Err(CellError::configuration(format!(
                "silence window {}ms outside 20-50ms",
                self.silence_window_ms
            )));
        }
        if self.response_timeout_ms <= self.silence_window_ms {
            return Err(CellError::configuration(format!(
                "response timeout {}ms must exceed silence window {}ms",
                self.response_timeout_ms, self.silence_window_ms
            )));
        }
        Ok(())
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub timing: FrameTiming,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: Parity::Even,
            data_bits: 8,
            stop_bits: 1,
            timing: FrameTiming::default(),
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> CellResult<()> {
        if self.port.is_empty() {
            return Err(CellError::configuration("serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(CellError::configuration("baud rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(CellError::configuration(format!("unsupported data bits {}", self.data_bits)));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(CellError::configuration(format!("unsupported stop bits {}", self.stop_bits)));
        }
        self.timing.validate()
    }
}

/// Modbus TCP client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpClientConfig {
    /// `host:port`
    pub address: String,
    pub connect_timeout_ms: u64,
    /// Socket receive deadline per transaction
    pub response_timeout_ms: u64,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_CONTROLLER_PORT),
            connect_timeout_ms: 3000,
            response_timeout_ms: 2000,
        }
    }
}

/// Node ids of the field devices on the serial bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeIds {
    pub sensor: u8,
    pub drive: u8,
    pub counter: u8,
}

impl Default for NodeIds {
    fn default() -> Self {
        Self {
            sensor: 1,
            drive: 2,
            counter: 3,
        }
    }
}

/// Field controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub serial: SerialConfig,
    pub nodes: NodeIds,
    /// Bind address of the controller's own register interface
    pub bind_address: String,
    pub poll_interval_ms: u64,
    pub tick_interval_ms: u64,
    /// Fixed incremental move issued when the counter reaches its target
    pub move_pulses: i32,
    pub move_speed: u32,
    /// Allowed time for an automatic move to report in-position
    pub motor_timeout_ms: u64,
    /// Administrative enable of the automatic cycle
    pub auto_enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            nodes: NodeIds::default(),
            bind_address: format!("0.0.0.0:{}", DEFAULT_CONTROLLER_PORT),
            poll_interval_ms: 300,
            tick_interval_ms: 200,
            move_pulses: 5000,
            move_speed: 8000,
            motor_timeout_ms: 10_000,
            auto_enabled: true,
        }
    }
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn motor_timeout(&self) -> Duration {
        Duration::from_millis(self.motor_timeout_ms)
    }

    pub fn validate(&self) -> CellResult<()> {
        self.serial.validate()?;
        for id in [self.nodes.sensor, self.nodes.drive, self.nodes.counter] {
            validation::validate_slave_id(id)?;
        }
        if self.tick_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(CellError::configuration("intervals must be positive"));
        }
        validation::validate_speed(self.move_speed as i64)
            .map_err(|e| CellError::configuration(e.to_string()))?;
        Ok(())
    }
}

/// Supervisory bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub controller: TcpClientConfig,
    /// Unit id addressed on the controller's register interface
    pub controller_unit_id: u8,
    pub operator_bind_address: String,
    pub poll_interval_ms: u64,
    /// Entries kept in the operator command history
    pub command_history: usize,
    /// Status frames queued for the operator before new ones are dropped
    pub operator_queue: usize,
    /// A status write to the operator taking longer than this drops the link
    pub operator_write_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            controller: TcpClientConfig::default(),
            controller_unit_id: 1,
            operator_bind_address: format!("0.0.0.0:{}", DEFAULT_OPERATOR_PORT),
            poll_interval_ms: 500,
            command_history: 10,
            operator_queue: 16,
            operator_write_timeout_ms: 2000,
        }
    }
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operator_write_timeout(&self) -> Duration {
        Duration::from_millis(self.operator_write_timeout_ms)
    }

    pub fn validate(&self) -> CellResult<()> {
        validation::validate_slave_id(self.controller_unit_id)?;
        if self.poll_interval_ms == 0 || self.operator_write_timeout_ms == 0 {
            return Err(CellError::configuration("intervals must be positive"));
        }
        if self.operator_queue == 0 {
            return Err(CellError::configuration("operator queue must hold at least one frame"));
        }
        Ok(())
    }
}

/// Read a JSON overlay from `path`; fields it omits keep their defaults
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> CellResult<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| CellError::configuration(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| CellError::configuration(format!("{}: {}", path.display(), e)))
}
