//! Field devices on the serial bus.
//!
//! Each device wraps a shared [`FieldTransport`] and turns register traffic
//! into engineering values (temperature, position, status bits, counts) or
//! motion commands. A device never fails loudly: every call returns a
//! [`CellResult`], updates the device's counters and connectivity flag, and
//! reports problems to the event sink.
//!
//! ```text
//! Sensor  (node 1)  IR 0x0001..0x0002   temperature, humidity (signed tenths)
//! Drive   (node 2)  HR 0x0000           step enable
//!                   HR 0x0001           alarm reset
//!                   HR 0x0002           stop
//!                   HR 0x0010..0x0013   absolute move    [pos hi, pos lo, speed hi, speed lo]
//!                   HR 0x0020..0x0023   incremental move [pos hi, pos lo, speed hi, speed lo]
//!                   HR 0x0030..0x0033   jog              [speed hi, speed lo, 0, direction]
//!                   HR 0x1000..0x1001   actual position (signed 32-bit)
//!                   HR 0x1010           status word
//! Counter (node 3)  HR 0x0000..0x0003   value, target, done, reset
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::{CellError, CellResult};
use crate::logging::EventSink;
use crate::protocol::{data_utils, ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::FieldTransport;

/// Temperature/humidity sensor registers
pub mod sensor_map {
    pub const BASE: u16 = 0x0001;
    pub const COUNT: u16 = 2;
}

/// Stepper drive registers
pub mod drive_map {
    pub const STEP_ENABLE: u16 = 0x0000;
    pub const ALARM_RESET: u16 = 0x0001;
    pub const STOP: u16 = 0x0002;
    pub const MOVE_ABSOLUTE: u16 = 0x0010;
    pub const MOVE_INCREMENTAL: u16 = 0x0020;
    pub const JOG: u16 = 0x0030;
    pub const POSITION: u16 = 0x1000;
    pub const STATUS: u16 = 0x1010;

    pub const STATUS_ALARM_BIT: u16 = 8;
    pub const STATUS_IN_POSITION_BIT: u16 = 4;
    pub const STATUS_RUNNING_BIT: u16 = 2;

    pub const JOG_CW: u16 = 1;
    pub const JOG_CCW: u16 = 0;
}

/// Pulse counter registers
pub mod counter_map {
    pub const VALUE: u16 = 0x0000;
    pub const TARGET: u16 = 0x0001;
    pub const DONE: u16 = 0x0002;
    pub const RESET: u16 = 0x0003;
    pub const BLOCK_LEN: u16 = 4;
    pub const DONE_BIT: u16 = 0x0001;
}

/// Per-device transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounters {
    pub ok: u64,
    pub timeouts: u64,
    pub checksum_errors: u64,
    pub errors: u64,
}

/// Connectivity and health of one device, for the presentation tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub slave_id: SlaveId,
    pub connected: bool,
    pub counters: DeviceCounters,
    pub last_error: Option<String>,
    pub last_read: Option<DateTime<Local>>,
}

/// Common surface of every field device
#[async_trait]
pub trait FieldDevice: Send + Sync {
    fn name(&self) -> &str;

    fn slave_id(&self) -> SlaveId;

    fn status(&self) -> DeviceStatus;

    /// Probe the node with a one-register read
    async fn ping(&self) -> bool;
}

#[derive(Debug, Default)]
struct DeviceState {
    connected: bool,
    counters: DeviceCounters,
    last_error: Option<String>,
    last_read: Option<DateTime<Local>>,
}

/// Identity, transport and bookkeeping shared by the concrete devices
struct DeviceCore {
    name: String,
    slave_id: SlaveId,
    transport: Arc<dyn FieldTransport>,
    events: EventSink,
    state: Mutex<DeviceState>,
}

impl DeviceCore {
    fn new(name: &str, slave_id: SlaveId, transport: Arc<dyn FieldTransport>, events: EventSink) -> Self {
        Self {
            name: name.to_string(),
            slave_id,
            transport,
            events,
            state: Mutex::new(DeviceState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> DeviceStatus {
        let state = self.state();
        DeviceStatus {
            name: self.name.clone(),
            slave_id: self.slave_id,
            connected: state.connected,
            counters: state.counters,
            last_error: state.last_error.clone(),
            last_read: state.last_read,
        }
    }

    fn record_success(&self) {
        let mut state = self.state();
        state.connected = true;
        state.counters.ok += 1;
        state.last_error = None;
        state.last_read = Some(Local::now());
    }

    fn record_failure(&self, operation: &str, error: &CellError) {
        {
            let mut state = self.state();
            match error {
                CellError::Timeout { .. } => state.counters.timeouts += 1,
                CellError::ChecksumMismatch { .. } => state.counters.checksum_errors += 1,
                _ => state.counters.errors += 1,
            }
            // an exception reply still proves the node is on the bus
            if !matches!(error, CellError::Exception { .. }) {
                state.connected = false;
            }
            state.last_error = Some(error.to_string());
        }
        self.events.warn(&self.name, &format!("{} failed: {}", operation, error));
    }

    async fn execute(&self, operation: &str, request: ModbusRequest) -> CellResult<ModbusResponse> {
        match self.transport.request(&request).await {
            Ok(response) => {
                self.record_success();
                Ok(response)
            }
            Err(e) => {
                self.record_failure(operation, &e);
                Err(e)
            }
        }
    }

    /// Read exactly `quantity` registers
    async fn read(&self, operation: &str, request: ModbusRequest) -> CellResult<Vec<u16>> {
        let quantity = request.quantity as usize;
        let response = self.execute(operation, request).await?;
        let registers = response.registers();
        if registers.len() < quantity {
            let err = CellError::malformed(format!(
                "{} returned {} registers, expected {}",
                operation,
                registers.len(),
                quantity
            ));
            self.record_failure(operation, &err);
            return Err(err);
        }
        Ok(registers[..quantity].to_vec())
    }

    async fn write_single(&self, operation: &str, address: u16, value: u16) -> CellResult<()> {
        self.execute(operation, ModbusRequest::write_single(self.slave_id, address, value))
            .await?;
        self.events.info(&self.name, operation);
        Ok(())
    }

    async fn write_block(&self, operation: &str, address: u16, values: &[u16]) -> CellResult<()> {
        self.execute(operation, ModbusRequest::write_multiple(self.slave_id, address, values))
            .await?;
        self.events.info(&self.name, operation);
        Ok(())
    }

    async fn ping(&self) -> bool {
        let alive = self.transport.ping(self.slave_id).await;
        let mut state = self.state();
        state.connected = alive;
        if alive {
            state.counters.ok += 1;
            state.last_error = None;
        } else {
            state.counters.timeouts += 1;
            state.last_error = Some("Ping timeout".to_string());
        }
        alive
    }
}

macro_rules! impl_field_device {
    ($device:ty) => {
        #[async_trait]
        impl FieldDevice for $device {
            fn name(&self) -> &str {
                &self.core.name
            }

            fn slave_id(&self) -> SlaveId {
                self.core.slave_id
            }

            fn status(&self) -> DeviceStatus {
                self.core.status()
            }

            async fn ping(&self) -> bool {
                self.core.ping().await
            }
        }
    };
}

/// Decoded sensor sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Percent relative humidity
    pub humidity: f64,
    pub timestamp: DateTime<Local>,
}

/// Temperature and humidity sensor
pub struct Sensor {
    core: DeviceCore,
    last: Mutex<Option<SensorReading>>,
}

impl Sensor {
    pub fn new(slave_id: SlaveId, transport: Arc<dyn FieldTransport>, events: EventSink) -> Self {
        Self {
            core: DeviceCore::new("Sensor", slave_id, transport, events),
            last: Mutex::new(None),
        }
    }

    pub async fn read(&self) -> CellResult<SensorReading> {
        let registers = self
            .core
            .read(
                "sensor read",
                ModbusRequest::read_input(self.core.slave_id, sensor_map::BASE, sensor_map::COUNT),
            )
            .await?;
        let reading = SensorReading {
            temperature: data_utils::tenths_to_f64(registers[0]),
            humidity: data_utils::tenths_to_f64(registers[1]),
            timestamp: Local::now(),
        };
        self.core.events.debug(
            &self.core.name,
            &format!("Temp: {:.1}°C, Humi: {:.1}%", reading.temperature, reading.humidity),
        );
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(reading);
        Ok(reading)
    }

    pub fn last_reading(&self) -> Option<SensorReading> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl_field_device!(Sensor);

/// Drive status word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriveStatus {
    pub raw: u16,
    pub alarm: bool,
    pub in_position: bool,
    pub running: bool,
}

impl DriveStatus {
    pub fn from_word(raw: u16) -> Self {
        let bit = |n: u16| (raw >> n) & 0x01 != 0;
        Self {
            raw,
            alarm: bit(drive_map::STATUS_ALARM_BIT),
            in_position: bit(drive_map::STATUS_IN_POSITION_BIT),
            running: bit(drive_map::STATUS_RUNNING_BIT),
        }
    }

    pub fn to_word(self) -> u16 {
        let mut word = self.raw
            & !((1 << drive_map::STATUS_ALARM_BIT)
                | (1 << drive_map::STATUS_IN_POSITION_BIT)
                | (1 << drive_map::STATUS_RUNNING_BIT));
        if self.alarm {
            word |= 1 << drive_map::STATUS_ALARM_BIT;
        }
        if self.in_position {
            word |= 1 << drive_map::STATUS_IN_POSITION_BIT;
        }
        if self.running {
            word |= 1 << drive_map::STATUS_RUNNING_BIT;
        }
        word
    }
}

/// Stepper motor drive
pub struct Drive {
    core: DeviceCore,
    last_status: Mutex<Option<DriveStatus>>,
    last_position: Mutex<Option<i32>>,
}

impl Drive {
    pub fn new(slave_id: SlaveId, transport: Arc<dyn FieldTransport>, events: EventSink) -> Self {
        Self {
            core: DeviceCore::new("Drive", slave_id, transport, events),
            last_status: Mutex::new(None),
            last_position: Mutex::new(None),
        }
    }

    pub async fn read_status(&self) -> CellResult<DriveStatus> {
        let registers = self
            .core
            .read("status read", ModbusRequest::read_holding(self.core.slave_id, drive_map::STATUS, 1))
            .await?;
        let status = DriveStatus::from_word(registers[0]);
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
        Ok(status)
    }

    pub async fn read_position(&self) -> CellResult<i32> {
        let registers = self
            .core
            .read("position read", ModbusRequest::read_holding(self.core.slave_id, drive_map::POSITION, 2))
            .await?;
        let position = data_utils::registers_to_i32(registers[0], registers[1]);
        *self.last_position.lock().unwrap_or_else(|e| e.into_inner()) = Some(position);
        Ok(position)
    }

    pub fn last_status(&self) -> Option<DriveStatus> {
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_position(&self) -> Option<i32> {
        *self.last_position.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn step_on(&self) -> CellResult<()> {
        self.core.write_single("step on", drive_map::STEP_ENABLE, 1).await
    }

    pub async fn step_off(&self) -> CellResult<()> {
        self.core.write_single("step off", drive_map::STEP_ENABLE, 0).await
    }

    pub async fn reset_alarm(&self) -> CellResult<()> {
        self.core.write_single("alarm reset", drive_map::ALARM_RESET, 1).await
    }

    pub async fn stop(&self) -> CellResult<()> {
        self.core.write_single("stop", drive_map::STOP, 1).await
    }

    pub async fn jog_cw(&self, speed: u32) -> CellResult<()> {
        self.jog(speed, drive_map::JOG_CW).await
    }

    pub async fn jog_ccw(&self, speed: u32) -> CellResult<()> {
        self.jog(speed, drive_map::JOG_CCW).await
    }

    async fn jog(&self, speed: u32, direction: u16) -> CellResult<()> {
        let [hi, lo] = data_utils::u32_to_registers(speed);
        let label = if direction == drive_map::JOG_CW { "jog CW" } else { "jog CCW" };
        self.core
            .write_block(&format!("{} @ {} pps", label, speed), drive_map::JOG, &[hi, lo, 0, direction])
            .await
    }

    pub async fn move_absolute(&self, position: i32, speed: u32) -> CellResult<()> {
        self.move_to(drive_map::MOVE_ABSOLUTE, "move absolute", position, speed).await
    }

    pub async fn move_incremental(&self, distance: i32, speed: u32) -> CellResult<()> {
        self.move_to(drive_map::MOVE_INCREMENTAL, "move incremental", distance, speed).await
    }

    async fn move_to(&self, base: u16, label: &str, position: i32, speed: u32) -> CellResult<()> {
        let [pos_hi, pos_lo] = data_utils::i32_to_registers(position);
        let [spd_hi, spd_lo] = data_utils::u32_to_registers(speed);
        self.core
            .write_block(
                &format!("{}: pos={}, speed={} pps", label, position, speed),
                base,
                &[pos_hi, pos_lo, spd_hi, spd_lo],
            )
            .await
    }
}

impl_field_device!(Drive);

/// Pulse counter block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterReading {
    pub value: u16,
    pub target: u16,
    pub done: bool,
}

impl CounterReading {
    /// Count has reached a positive target
    pub fn at_target(&self) -> bool {
        self.done || (self.target > 0 && self.value >= self.target)
    }
}

/// External pulse counter
pub struct PulseCounter {
    core: DeviceCore,
    last: Mutex<Option<CounterReading>>,
}

impl PulseCounter {
    pub fn new(slave_id: SlaveId, transport: Arc<dyn FieldTransport>, events: EventSink) -> Self {
        Self {
            core: DeviceCore::new("Counter", slave_id, transport, events),
            last: Mutex::new(None),
        }
    }

    pub async fn read(&self) -> CellResult<CounterReading> {
        let registers = self
            .core
            .read(
                "counter read",
                ModbusRequest::read_holding(self.core.slave_id, counter_map::VALUE, counter_map::BLOCK_LEN),
            )
            .await?;
        let reading = CounterReading {
            value: registers[counter_map::VALUE as usize],
            target: registers[counter_map::TARGET as usize],
            done: registers[counter_map::DONE as usize] & counter_map::DONE_BIT != 0,
        };
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(reading);
        Ok(reading)
    }

    pub fn last_reading(&self) -> Option<CounterReading> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn set_target(&self, target: u16) -> CellResult<()> {
        self.core
            .write_single(&format!("target = {}", target), counter_map::TARGET, target)
            .await
    }

    /// Ask the counter to zero itself and clear its done flag
    pub async fn reset(&self) -> CellResult<()> {
        self.core.write_single("counter reset", counter_map::RESET, 1).await
    }
}

impl_field_device!(PulseCounter);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameTiming, NodeIds, SerialConfig};
    use crate::simulator::FieldSimulator;
    use crate::transport::SerialTransport;
    use tokio::io::duplex;

    async fn bus() -> (Arc<FieldSimulator>, Arc<dyn FieldTransport>) {
        let simulator = Arc::new(FieldSimulator::new(NodeIds::default()));
        let transport = SerialTransport::new(SerialConfig {
            port: "sim".to_string(),
            timing: FrameTiming {
                response_timeout_ms: 200,
                settle_delay_ms: 1,
                silence_window_ms: 20,
            },
            ..SerialConfig::default()
        });
        let (near, far) = duplex(512);
        transport.attach(near).await;
        tokio::spawn(simulator.clone().serve_rtu(far));
        (simulator, Arc::new(transport))
    }

    #[test]
    fn test_drive_status_bits() {
        let status = DriveStatus::from_word(0x0114);
        assert!(status.alarm);
        assert!(status.in_position);
        assert!(status.running);

        let status = DriveStatus::from_word(0x0010);
        assert!(!status.alarm && status.in_position && !status.running);
        assert_eq!(status.to_word(), 0x0010);
    }

    #[test]
    fn test_counter_at_target() {
        assert!(CounterReading { value: 20, target: 20, done: false }.at_target());
        assert!(CounterReading { value: 3, target: 20, done: true }.at_target());
        assert!(!CounterReading { value: 5, target: 0, done: false }.at_target());
    }

    #[tokio::test]
    async fn test_sensor_read_decodes_tenths() {
        let (simulator, transport) = bus().await;
        simulator.set_sensor(-12.5, 48.0);
        let sensor = Sensor::new(1, transport, EventSink::default());

        let reading = sensor.read().await.unwrap();
        assert!((reading.temperature + 12.5).abs() < 1e-9);
        assert!((reading.humidity - 48.0).abs() < 1e-9);

        let status = sensor.status();
        assert!(status.connected);
        assert_eq!(status.counters.ok, 1);
        assert!(status.last_read.is_some());
    }

    #[tokio::test]
    async fn test_drive_commands_reach_registers() {
        let (simulator, transport) = bus().await;
        let drive = Drive::new(2, transport, EventSink::default());

        drive.move_absolute(-70_000, 8000).await.unwrap();
        assert_eq!(
            simulator.written(2, drive_map::MOVE_ABSOLUTE),
            vec![vec![0xFFFE, 0xEE90, 0x0000, 0x1F40]]
        );

        simulator.step();
        assert!(drive.read_status().await.unwrap().running);
        simulator.step();
        assert_eq!(drive.read_position().await.unwrap(), -70_000);
        assert!(drive.read_status().await.unwrap().in_position);

        drive.jog_ccw(1200).await.unwrap();
        assert_eq!(simulator.written(2, drive_map::JOG), vec![vec![0, 1200, 0, 0]]);
        drive.stop().await.unwrap();
        simulator.step();
        let status = drive.read_status().await.unwrap();
        assert!(status.in_position);
        assert!(!status.running);
        assert_eq!(drive.last_position(), Some(-70_000));
        assert_eq!(drive.status().counters.ok, 7);
    }

    #[tokio::test]
    async fn test_counter_target_and_reset() {
        let (simulator, transport) = bus().await;
        let counter = PulseCounter::new(3, transport, EventSink::default());

        counter.set_target(20).await.unwrap();
        simulator.set_counter(20);
        let reading = counter.read().await.unwrap();
        assert_eq!(reading, CounterReading { value: 20, target: 20, done: true });

        counter.reset().await.unwrap();
        simulator.step();
        let reading = counter.read().await.unwrap();
        assert_eq!(reading.value, 0);
        assert!(!reading.done);
    }

    #[tokio::test]
    async fn test_silent_node_marks_disconnected() {
        let (_simulator, transport) = bus().await;
        let events = EventSink::default();
        let sensor = Sensor::new(42, transport, events.clone());

        assert!(matches!(sensor.read().await, Err(CellError::Timeout { .. })));
        let status = sensor.status();
        assert!(!status.connected);
        assert_eq!(status.counters.timeouts, 1);
        assert!(status.last_error.is_some());
        assert!(!sensor.ping().await);
        assert!(events.recent_lines().iter().any(|line| line.contains("sensor read failed")));
    }
}
