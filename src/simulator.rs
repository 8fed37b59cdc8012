/// Field bus simulator
///
/// Emulates the three field nodes of the cell (sensor, drive, pulse counter)
/// on top of per-node register banks. It answers serial frames directly
/// through [`FieldSimulator::serve_rtu`], and the same banks can be handed to
/// a [`VirtualSlaveServer`](crate::server::VirtualSlaveServer) to expose them
/// over TCP.
///
/// Device behavior is driven by [`FieldSimulator::step`], which reads the
/// command registers, moves the drive and advances the counter:
///
/// - a move block (absolute or incremental) starts the motor; the next step
///   lands it on the target with the in-position bit set
/// - a jog block keeps the motor turning until a stop write
/// - a write of 1 to the counter's reset register zeroes it
/// - with counting enabled the counter climbs by one per step until it
///   reaches its target

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::NodeIds;
use crate::device::{counter_map, drive_map, sensor_map, DriveStatus};
use crate::protocol::{
    data_utils, exception_pdu, unwrap_frame, wrap_pdu, Framing, ModbusException, ModbusFunction,
    ModbusRequest, SlaveId,
};
use crate::register_bank::ModbusRegisterBank;
use crate::server::{execute, NodeBanks};
use crate::transport::SerialLink;

/// Temperature and humidity the sensor starts at, in tenths
const SEED_TEMPERATURE: u16 = 250;
const SEED_HUMIDITY: u16 = 600;

/// Simulated time covered by one jog step
const JOG_STEP_DIVISOR: u32 = 10;

/// One register write observed on the serial side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub unit_id: SlaveId,
    pub address: u16,
    pub values: Vec<u16>,
}

/// Simulator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub requests: u64,
    pub responses: u64,
    pub exceptions: u64,
    /// Frames dropped for a bad checksum or a foreign node id
    pub ignored: u64,
}

#[derive(Debug, Clone)]
struct SimOptions {
    counting: bool,
    jitter: bool,
    error_rate: f32,
    response_delay: Duration,
}

#[derive(Debug, Default)]
struct DriveModel {
    pending_target: Option<i32>,
    jog: Option<(u32, bool)>,
}

/// Simulated sensor, drive and counter
pub struct FieldSimulator {
    nodes: NodeIds,
    banks: Arc<NodeBanks>,
    options: SimOptions,
    drive: Mutex<DriveModel>,
    writes: Mutex<Vec<WriteRecord>>,
    stats: Mutex<SimulatorStats>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FieldSimulator {
    /// Deterministic simulator: no counting, no jitter, no injected faults
    pub fn new(nodes: NodeIds) -> Self {
        let simulator = Self {
            nodes,
            banks: Arc::new(NodeBanks::default()),
            options: SimOptions {
                counting: false,
                jitter: false,
                error_rate: 0.0,
                response_delay: Duration::ZERO,
            },
            drive: Mutex::new(DriveModel::default()),
            writes: Mutex::new(Vec::new()),
            stats: Mutex::new(SimulatorStats::default()),
        };
        simulator.seed_defaults();
        simulator
    }

    /// Let the counter climb by one per step
    pub fn with_counting(mut self, enabled: bool) -> Self {
        self.options.counting = enabled;
        self
    }

    /// Add small random noise to the sensor on every step
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.options.jitter = enabled;
        self
    }

    /// Answer this fraction of serial requests with a device-failure exception
    pub fn with_error_rate(mut self, rate: f32) -> Self {
        self.options.error_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.options.response_delay = delay;
        self
    }

    pub fn banks(&self) -> Arc<NodeBanks> {
        self.banks.clone()
    }

    fn sensor_bank(&self) -> Arc<ModbusRegisterBank> {
        self.banks.bank(self.nodes.sensor)
    }

    fn drive_bank(&self) -> Arc<ModbusRegisterBank> {
        self.banks.bank(self.nodes.drive)
    }

    fn counter_bank(&self) -> Arc<ModbusRegisterBank> {
        self.banks.bank(self.nodes.counter)
    }

    /// Load the power-on register image of every node
    pub fn seed_defaults(&self) {
        self.sensor_bank()
            .write_input_registers(sensor_map::BASE, &[SEED_TEMPERATURE, SEED_HUMIDITY]);

        let drive = self.drive_bank();
        drive.write_holding_registers(drive_map::POSITION, &[0, 0]);
        let idle = DriveStatus {
            in_position: true,
            ..DriveStatus::default()
        };
        drive.write_holding_register(drive_map::STATUS, idle.to_word());

        self.counter_bank()
            .write_holding_registers(counter_map::VALUE, &[0; counter_map::BLOCK_LEN as usize]);
    }

    pub fn set_sensor(&self, temperature: f64, humidity: f64) {
        self.sensor_bank().write_input_registers(
            sensor_map::BASE,
            &[data_utils::f64_to_tenths(temperature), data_utils::f64_to_tenths(humidity)],
        );
    }

    pub fn set_drive_alarm(&self, alarm: bool) {
        let bank = self.drive_bank();
        let mut status = DriveStatus::from_word(bank.read_holding_register(drive_map::STATUS));
        status.alarm = alarm;
        bank.write_holding_register(drive_map::STATUS, status.to_word());
    }

    /// Force the counter value; the done flag follows the stored target
    pub fn set_counter(&self, value: u16) {
        let bank = self.counter_bank();
        let target = bank.read_holding_register(counter_map::TARGET);
        bank.write_holding_register(counter_map::VALUE, value);
        bank.write_holding_register(counter_map::DONE, done_flag(value, target));
    }

    pub fn drive_position(&self) -> i32 {
        let regs = self.drive_bank().read_holding_registers(drive_map::POSITION, 2);
        data_utils::registers_to_i32(regs[0], regs[1])
    }

    pub fn drive_status(&self) -> DriveStatus {
        DriveStatus::from_word(self.drive_bank().read_holding_register(drive_map::STATUS))
    }

    /// `(value, target, done)` of the counter
    pub fn counter(&self) -> (u16, u16, bool) {
        let regs = self
            .counter_bank()
            .read_holding_registers(counter_map::VALUE, counter_map::BLOCK_LEN);
        (regs[0], regs[1], regs[2] & counter_map::DONE_BIT != 0)
    }

    /// Values written to `address` of `unit_id` over the serial side, oldest first
    pub fn written(&self, unit_id: SlaveId, address: u16) -> Vec<Vec<u16>> {
        guard(&self.writes)
            .iter()
            .filter(|w| w.unit_id == unit_id && w.address == address)
            .map(|w| w.values.clone())
            .collect()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        guard(&self.writes).clone()
    }

    pub fn clear_writes(&self) {
        guard(&self.writes).clear();
    }

    pub fn stats(&self) -> SimulatorStats {
        guard(&self.stats).clone()
    }

    fn serves(&self, unit_id: SlaveId) -> bool {
        unit_id == self.nodes.sensor || unit_id == self.nodes.drive || unit_id == self.nodes.counter
    }

    /// Answer one serial frame; `None` when the frame is not for us
    pub fn handle_rtu_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let (unit_id, pdu) = match unwrap_frame(frame, Framing::Rtu) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("simulator ignoring frame: {}", e);
                guard(&self.stats).ignored += 1;
                return None;
            }
        };
        if !self.serves(unit_id) {
            guard(&self.stats).ignored += 1;
            return None;
        }
        guard(&self.stats).requests += 1;

        if self.options.error_rate > 0.0 && rand::random::<f32>() < self.options.error_rate {
            let function_code = pdu.first().copied().unwrap_or(0);
            guard(&self.stats).exceptions += 1;
            return Some(wrap_pdu(
                Framing::Rtu,
                unit_id,
                &exception_pdu(function_code, ModbusException::ServerDeviceFailure),
            ));
        }

        let reply = match ModbusRequest::from_pdu(unit_id, pdu) {
            Ok(request) => {
                if !request.function.is_read_function() {
                    guard(&self.writes).push(WriteRecord {
                        unit_id,
                        address: request.address,
                        values: request.values.clone(),
                    });
                }
                execute(&self.banks.bank(unit_id), &request).to_pdu()
            }
            Err(exception) => {
                guard(&self.stats).exceptions += 1;
                exception_pdu(pdu.first().copied().unwrap_or(0), exception)
            }
        };
        guard(&self.stats).responses += 1;
        Some(wrap_pdu(Framing::Rtu, unit_id, &reply))
    }

    /// Serve serial requests arriving on `link` until it closes
    pub async fn serve_rtu<L: SerialLink + 'static>(self: Arc<Self>, mut link: L) {
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let n = match link.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("simulator link error: {}", e);
                    break;
                }
            };
            pending.extend_from_slice(&chunk[..n]);

            while let Some(len) = rtu_request_len(&pending) {
                if pending.len() < len {
                    break;
                }
                let frame: Vec<u8> = pending.drain(..len).collect();
                if let Some(reply) = self.handle_rtu_frame(&frame) {
                    if !self.options.response_delay.is_zero() {
                        tokio::time::sleep(self.options.response_delay).await;
                    }
                    if link.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }

        debug!("simulator link closed");
    }

    /// Advance the drive, counter and sensor by one step
    pub fn step(&self) {
        self.step_drive();
        self.step_counter();
        if self.options.jitter {
            self.jitter_sensor();
        }
    }

    fn step_drive(&self) {
        let bank = self.drive_bank();
        let mut model = guard(&self.drive);
        let mut status = DriveStatus::from_word(bank.read_holding_register(drive_map::STATUS));
        let mut position = self.drive_position();

        // motion started on an earlier step
        if let Some(target) = model.pending_target.take() {
            position = target;
            status.running = false;
            status.in_position = true;
        }
        if let Some((speed, clockwise)) = model.jog {
            let delta = (speed / JOG_STEP_DIVISOR) as i32;
            position = if clockwise {
                position.wrapping_add(delta)
            } else {
                position.wrapping_sub(delta)
            };
        }

        if bank.read_holding_register(drive_map::ALARM_RESET) != 0 {
            bank.write_holding_register(drive_map::ALARM_RESET, 0);
            status.alarm = false;
            info!("simulated drive: alarm cleared");
        }

        for (base, incremental) in [(drive_map::MOVE_ABSOLUTE, false), (drive_map::MOVE_INCREMENTAL, true)] {
            let block = bank.read_holding_registers(base, 4);
            let speed = data_utils::registers_to_u32(block[2], block[3]);
            if speed == 0 {
                continue;
            }
            bank.write_holding_registers(base, &[0; 4]);
            let value = data_utils::registers_to_i32(block[0], block[1]);
            let target = if incremental { position.wrapping_add(value) } else { value };
            if status.alarm {
                warn!("simulated drive: move to {} refused while in alarm", target);
                continue;
            }
            info!("simulated drive: moving to {} at {} pps", target, speed);
            model.pending_target = Some(target);
            model.jog = None;
            status.running = true;
            status.in_position = false;
        }

        let jog = bank.read_holding_registers(drive_map::JOG, 4);
        let jog_speed = data_utils::registers_to_u32(jog[0], jog[1]);
        if jog_speed != 0 {
            bank.write_holding_registers(drive_map::JOG, &[0; 4]);
            if !status.alarm {
                model.jog = Some((jog_speed, jog[3] == drive_map::JOG_CW));
                model.pending_target = None;
                status.running = true;
                status.in_position = false;
            }
        }

        if bank.read_holding_register(drive_map::STOP) != 0 {
            bank.write_holding_register(drive_map::STOP, 0);
            model.pending_target = None;
            model.jog = None;
            status.running = false;
            status.in_position = true;
            info!("simulated drive: stopped at {}", position);
        }

        bank.write_holding_registers(drive_map::POSITION, &data_utils::i32_to_registers(position));
        bank.write_holding_register(drive_map::STATUS, status.to_word());
    }

    fn step_counter(&self) {
        let bank = self.counter_bank();
        let regs = bank.read_holding_registers(counter_map::VALUE, counter_map::BLOCK_LEN);
        let (mut value, target) = (regs[0], regs[1]);

        if regs[counter_map::RESET as usize] != 0 {
            bank.write_holding_register(counter_map::RESET, 0);
            value = 0;
            info!("simulated counter: reset");
        } else if self.options.counting && target > 0 && value < target {
            value += 1;
        }

        bank.write_holding_register(counter_map::VALUE, value);
        bank.write_holding_register(counter_map::DONE, done_flag(value, target));
    }

    fn jitter_sensor(&self) {
        let bank = self.sensor_bank();
        let regs = bank.read_input_registers(sensor_map::BASE, 2);
        let temperature = data_utils::tenths_to_f64(regs[0]) + (rand::random::<f64>() - 0.5) * 0.4;
        let humidity = (data_utils::tenths_to_f64(regs[1]) + (rand::random::<f64>() - 0.5) * 1.0).clamp(0.0, 100.0);
        self.set_sensor(temperature, humidity);
    }

    /// Step forever at `interval`
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.step();
        }
    }
}

fn done_flag(value: u16, target: u16) -> u16 {
    if target > 0 && value >= target {
        counter_map::DONE_BIT
    } else {
        0
    }
}

/// Length of the serial request at the head of `buffer`, once knowable
///
/// Unknown function codes consume whatever is buffered so a garbled line
/// cannot stall the reader.
fn rtu_request_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    match ModbusFunction::from_u8(buffer[1]) {
        Some(ModbusFunction::WriteMultipleRegisters) => {
            let byte_count = *buffer.get(6)? as usize;
            Some(7 + byte_count + 2)
        }
        Some(_) => Some(8),
        None => Some(buffer.len()),
    }
}
