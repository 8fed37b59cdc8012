//! Field controller: polls the serial devices, serves its own register
//! interface over TCP and runs the automatic cycle.
//!
//! # Register interface
//!
//! The supervisory tier talks to the controller only through a
//! [`ModbusRegisterBank`] served by a [`VirtualSlaveServer`]:
//!
//! | Space   | Address | Meaning                                             |
//! |---------|---------|-----------------------------------------------------|
//! | holding | 0       | counter target                                      |
//! | holding | 8       | mode (0 auto, 1 manual)                             |
//! | holding | 10..15  | command packet `[cmd, pos hi, pos lo, speed, source, priority]` |
//! | input   | 0..11   | mirrored state, see [`controller_map`]              |
//!
//! # Automatic cycle
//!
//! ```text
//!            count reaches target            in-position
//!   Idle ───────────────────────► MotorRunning ─────────► WaitingReset
//!    ▲  WaitingCount ─────────────────┘  │                     │
//!    │                                   │ no in-position      │ counter back to 0
//!    │                                   ▼ within timeout      │
//!    │                             TimeoutMotor                │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Manual mode, the administrative disable, a drive alarm and a missing
//! target all pre-empt the cycle and are checked in that order every tick.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{controller_map as map, ControllerConfig};
use crate::device::{CounterReading, Drive, DriveStatus, FieldDevice, DeviceStatus, PulseCounter, Sensor};
use crate::error::{CellError, CellResult};
use crate::facade::CellFacade;
use crate::logging::EventSink;
use crate::protocol::data_utils;
use crate::register_bank::ModbusRegisterBank;
use crate::server::{ModbusServer, NodeBanks, VirtualSlaveConfig, VirtualSlaveServer};
use crate::transport::FieldTransport;
use crate::utils::format::registers_to_hex;

const COMPONENT: &str = "Controller";

/// Automatic-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AutoState {
    Idle,
    WaitingCount,
    MotorRunning,
    WaitingReset,
    Alarm,
    TimeoutMotor,
    Disabled,
    WaitingTarget,
    Manual,
}

impl AutoState {
    pub fn code(self) -> u16 {
        match self {
            AutoState::Idle => 0,
            AutoState::WaitingCount => 1,
            AutoState::MotorRunning => 2,
            AutoState::WaitingReset => 3,
            AutoState::Alarm => 4,
            AutoState::TimeoutMotor => 5,
            AutoState::Disabled => 6,
            AutoState::WaitingTarget => 7,
            AutoState::Manual => 8,
        }
    }

    /// Decode a mirrored state code; anything unknown restarts at `Idle`
    pub fn from_code(code: u16) -> Self {
        Self::try_from_code(code).unwrap_or(AutoState::Idle)
    }

    pub fn try_from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(AutoState::Idle),
            1 => Some(AutoState::WaitingCount),
            2 => Some(AutoState::MotorRunning),
            3 => Some(AutoState::WaitingReset),
            4 => Some(AutoState::Alarm),
            5 => Some(AutoState::TimeoutMotor),
            6 => Some(AutoState::Disabled),
            7 => Some(AutoState::WaitingTarget),
            8 => Some(AutoState::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AutoState::Idle => "Idle",
            AutoState::WaitingCount => "Waiting count",
            AutoState::MotorRunning => "Motor running",
            AutoState::WaitingReset => "Waiting reset",
            AutoState::Alarm => "Alarm",
            AutoState::TimeoutMotor => "Timeout motor",
            AutoState::Disabled => "Disabled",
            AutoState::WaitingTarget => "Waiting target",
            AutoState::Manual => "Manual",
        }
    }
}

impl fmt::Display for AutoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command codes carried in the first register of a command packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandCode {
    StepOn = 1,
    StepOff = 2,
    MoveAbsolute = 3,
    JogCw = 5,
    JogCcw = 6,
    Stop = 7,
    ResetAlarm = 8,
    EmergencyStop = 9,
}

impl CommandCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(CommandCode::StepOn),
            2 => Some(CommandCode::StepOff),
            3 => Some(CommandCode::MoveAbsolute),
            5 => Some(CommandCode::JogCw),
            6 => Some(CommandCode::JogCcw),
            7 => Some(CommandCode::Stop),
            8 => Some(CommandCode::ResetAlarm),
            9 => Some(CommandCode::EmergencyStop),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Who issued a command packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandSource {
    LocalUi,
    Remote,
    Other(u16),
}

impl CommandSource {
    pub fn from_u16(code: u16) -> Self {
        match code {
            2 => CommandSource::LocalUi,
            3 => CommandSource::Remote,
            other => CommandSource::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            CommandSource::LocalUi => 2,
            CommandSource::Remote => 3,
            CommandSource::Other(code) => code,
        }
    }

    /// Priority stamped when the sender gives none
    pub fn default_priority(self) -> u16 {
        match self {
            CommandSource::Remote => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::LocalUi => f.write_str("local UI"),
            CommandSource::Remote => f.write_str("remote operator"),
            CommandSource::Other(code) => write!(f, "source {}", code),
        }
    }
}

/// Six-register command block
///
/// Priority is carried for the audit log only; a single slot exists, so
/// nothing is ever reordered by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandPacket {
    pub command: u16,
    pub position: i32,
    pub speed: u16,
    pub source: u16,
    pub priority: u16,
}

impl CommandPacket {
    pub fn new(command: CommandCode, source: CommandSource, priority: u16) -> Self {
        Self {
            command: command.to_u16(),
            position: 0,
            speed: 0,
            source: source.code(),
            priority,
        }
    }

    pub fn with_motion(mut self, position: i32, speed: u16) -> Self {
        self.position = position;
        self.speed = speed;
        self
    }

    /// Fit a speed into the single speed register, warning when it is clamped
    pub fn register_speed(speed: i64, events: &EventSink) -> u16 {
        let clamped = speed.clamp(0, u16::MAX as i64) as u16;
        if clamped as i64 != speed {
            events.warn(
                "Command",
                &format!("speed {} does not fit the command packet, sending {}", speed, clamped),
            );
        }
        clamped
    }

    /// Decode; missing registers read as zero
    pub fn from_registers(registers: &[u16]) -> Self {
        let reg = |i: usize| registers.get(i).copied().unwrap_or(0);
        Self {
            command: reg(0),
            position: data_utils::registers_to_i32(reg(1), reg(2)),
            speed: reg(3),
            source: reg(4),
            priority: reg(5),
        }
    }

    pub fn to_registers(&self) -> [u16; map::COMMAND_LEN as usize] {
        let [pos_hi, pos_lo] = data_utils::i32_to_registers(self.position);
        [self.command, pos_hi, pos_lo, self.speed, self.source, self.priority]
    }
}

/// Last jog command issued to the drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum JogState {
    #[default]
    Stopped,
    Clockwise,
    CounterClockwise,
}

impl JogState {
    pub fn code(self) -> u16 {
        match self {
            JogState::Stopped => 0,
            JogState::Clockwise => 1,
            JogState::CounterClockwise => 2,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => JogState::Clockwise,
            2 => JogState::CounterClockwise,
            _ => JogState::Stopped,
        }
    }
}

/// Values decoded from the field plus the cycle bookkeeping
#[derive(Debug)]
struct ControlState {
    state: AutoState,
    last_target: u16,
    last_mode: Option<u16>,
    move_started: Option<Instant>,
    /// Bumped on every device write issued by a tick
    write_generation: u64,
    position: i32,
    speed: u16,
    temperature: f64,
    humidity: f64,
    sensor_ok: bool,
    drive: DriveStatus,
    counter: CounterReading,
    step_enabled: bool,
    jog: JogState,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            state: AutoState::Idle,
            last_target: 0,
            last_mode: None,
            move_started: None,
            write_generation: 0,
            position: 0,
            speed: 0,
            temperature: 0.0,
            humidity: 0.0,
            sensor_ok: false,
            drive: DriveStatus::default(),
            counter: CounterReading::default(),
            step_enabled: false,
            jog: JogState::Stopped,
        }
    }
}

/// Read-only view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub state: AutoState,
    pub state_text: &'static str,
    pub mode: u16,
    pub auto_enabled: bool,
    pub position: i32,
    pub speed: u16,
    pub temperature: f64,
    pub humidity: f64,
    pub sensor_ok: bool,
    pub drive: DriveStatus,
    pub counter: CounterReading,
    pub step_enabled: bool,
    pub jog: JogState,
    pub devices: Vec<DeviceStatus>,
}

/// Field controller
pub struct FieldController {
    config: ControllerConfig,
    bank: Arc<ModbusRegisterBank>,
    transport: Arc<dyn FieldTransport>,
    sensor: Sensor,
    drive: Drive,
    counter: PulseCounter,
    events: EventSink,
    auto_enabled: AtomicBool,
    state: Mutex<ControlState>,
}

impl FieldController {
    pub fn new(config: ControllerConfig, transport: Arc<dyn FieldTransport>, events: EventSink) -> Self {
        let nodes = config.nodes;
        Self {
            auto_enabled: AtomicBool::new(config.auto_enabled),
            bank: Arc::new(ModbusRegisterBank::new()),
            sensor: Sensor::new(nodes.sensor, transport.clone(), events.clone()),
            drive: Drive::new(nodes.drive, transport.clone(), events.clone()),
            counter: PulseCounter::new(nodes.counter, transport.clone(), events.clone()),
            transport,
            events,
            config,
            state: Mutex::new(ControlState::default()),
        }
    }

    /// The register bank behind the controller's TCP interface
    pub fn bank(&self) -> Arc<ModbusRegisterBank> {
        self.bank.clone()
    }

    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn set_auto_enabled(&self, enabled: bool) {
        if self.auto_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            let text = if enabled { "enabled" } else { "disabled" };
            self.events.info(COMPONENT, &format!("automatic cycle {}", text));
        }
    }

    pub fn auto_enabled(&self) -> bool {
        self.auto_enabled.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> AutoState {
        self.state.lock().await.state
    }

    fn mode(&self) -> u16 {
        self.bank.read_holding_register(map::HR_MODE)
    }

    /// Read every device once and refresh the mirrored registers
    ///
    /// Failed reads leave the previous values in place; the devices record
    /// the error and the next poll tries again. Drive and counter readings
    /// that started before a tick wrote to the devices are dropped.
    pub async fn poll_devices(&self) {
        if let Ok(position) = self.drive.read_position().await {
            self.state.lock().await.position = position;
        }
        let generation = self.state.lock().await.write_generation;
        if let Ok(status) = self.drive.read_status().await {
            let mut st = self.state.lock().await;
            if st.write_generation == generation {
                st.drive = status;
            } else {
                debug!("drive status read overtaken by a command, dropped");
            }
        }
        match self.sensor.read().await {
            Ok(reading) => {
                let mut st = self.state.lock().await;
                st.temperature = reading.temperature;
                st.humidity = reading.humidity;
                st.sensor_ok = true;
            }
            Err(_) => self.state.lock().await.sensor_ok = false,
        }
        let generation = self.state.lock().await.write_generation;
        if let Ok(reading) = self.counter.read().await {
            let mut st = self.state.lock().await;
            if st.write_generation == generation {
                st.counter = reading;
            } else {
                debug!("counter read overtaken by a command, dropped");
            }
        }

        let st = self.state.lock().await;
        self.mirror(&st);
    }

    /// Evaluate the automatic cycle once
    pub async fn tick(&self) -> AutoState {
        let mut st = self.state.lock().await;
        self.check_target(&mut st).await;

        let mode = self.mode();
        if st.last_mode != Some(mode) {
            self.events.info(COMPONENT, &format!("mode register = {}", mode));
            st.last_mode = Some(mode);
        }

        if mode == map::MODE_MANUAL {
            st.state = AutoState::Manual;
            self.dispatch_command(&mut st).await;
        } else if !self.auto_enabled() {
            st.state = AutoState::Disabled;
        } else if st.drive.alarm {
            if st.state != AutoState::Alarm {
                self.events.warn(COMPONENT, "automatic cycle halted: driver alarm");
            }
            st.state = AutoState::Alarm;
        } else if st.counter.target == 0 {
            st.state = AutoState::WaitingTarget;
        } else {
            self.advance(&mut st).await;
        }

        self.mirror(&st);
        st.state
    }

    /// Forward a changed target register to the counter
    async fn check_target(&self, st: &mut ControlState) {
        let target = self.bank.read_holding_register(map::HR_TARGET);
        if target == st.last_target {
            return;
        }
        st.last_target = target;
        st.write_generation += 1;
        self.events.info(COMPONENT, &format!("target register = {}, forwarding to counter", target));
        if let Err(e) = self.counter.set_target(target).await {
            self.events.warn(COMPONENT, &format!("counter did not confirm target {}: {}", target, e));
        }
        st.counter.target = target;
        st.counter.done = target > 0 && st.counter.value >= target;
        if st.state == AutoState::TimeoutMotor {
            st.state = AutoState::WaitingCount;
        }
    }

    async fn advance(&self, st: &mut ControlState) {
        match st.state {
            AutoState::MotorRunning => {
                if st.drive.in_position {
                    st.write_generation += 1;
                    match self.counter.reset().await {
                        Ok(()) => {
                            self.events.info(COMPONENT, "motor in position, counter reset requested");
                            st.state = AutoState::WaitingReset;
                        }
                        Err(e) => self.events.warn(COMPONENT, &format!("counter reset failed: {}", e)),
                    }
                } else if st
                    .move_started
                    .map_or(false, |started| started.elapsed() > self.config.motor_timeout())
                {
                    self.events.error(COMPONENT, "timeout waiting for motor in-position");
                    st.state = AutoState::TimeoutMotor;
                }
            }
            AutoState::WaitingReset => {
                if st.counter.value == 0 && !st.counter.done {
                    self.events.info(COMPONENT, "counter reset, new cycle");
                    st.state = AutoState::Idle;
                }
            }
            AutoState::Idle | AutoState::WaitingCount | AutoState::WaitingTarget => {
                if st.counter.at_target() {
                    self.start_move(st).await;
                } else {
                    st.state = AutoState::WaitingCount;
                }
            }
            AutoState::TimeoutMotor => {
                if !st.counter.at_target() {
                    st.state = AutoState::WaitingCount;
                }
            }
            AutoState::Alarm | AutoState::Disabled | AutoState::Manual => {
                st.state = AutoState::WaitingCount;
            }
        }
    }

    async fn start_move(&self, st: &mut ControlState) {
        let pulses = self.config.move_pulses;
        let speed = self.config.move_speed;
        st.write_generation += 1;
        match self.drive.move_incremental(pulses, speed).await {
            Ok(()) => {
                self.events.info(
                    COMPONENT,
                    &format!(
                        "count reached target ({}/{}), moving +{} pulses",
                        st.counter.value, st.counter.target, pulses
                    ),
                );
                st.state = AutoState::MotorRunning;
                st.move_started = Some(Instant::now());
                st.speed = speed.min(u16::MAX as u32) as u16;
                // in-position must come from a poll taken after the move
                st.drive.in_position = false;
                st.drive.running = true;
            }
            Err(e) => {
                self.events.warn(COMPONENT, &format!("automatic move not issued: {}", e));
                st.state = AutoState::WaitingCount;
            }
        }
    }

    /// Consume and execute the pending command packet, if any
    async fn dispatch_command(&self, st: &mut ControlState) {
        let block = self
            .bank
            .take_holding_block(map::HR_COMMAND, map::COMMAND_LEN, map::HR_COMMAND);
        let packet = CommandPacket::from_registers(&block);
        if packet.command == 0 {
            return;
        }
        debug!("command block taken: {}", registers_to_hex(&block));

        let source = CommandSource::from_u16(packet.source);
        self.events.info(
            COMPONENT,
            &format!(
                "manual command {} from {} (priority {}), pos={}, speed={}",
                packet.command, source, packet.priority, packet.position, packet.speed
            ),
        );

        let Some(code) = CommandCode::from_u16(packet.command) else {
            self.events.warn(COMPONENT, &format!("unknown command code {} dropped", packet.command));
            return;
        };

        let speed = packet.speed as u32;
        st.write_generation += 1;
        let result = match code {
            CommandCode::StepOn => self.drive.step_on().await.map(|_| st.step_enabled = true),
            CommandCode::StepOff => self.drive.step_off().await.map(|_| st.step_enabled = false),
            CommandCode::MoveAbsolute => self.drive.move_absolute(packet.position, speed).await.map(|_| {
                st.speed = packet.speed;
                st.jog = JogState::Stopped;
            }),
            CommandCode::JogCw => self.drive.jog_cw(speed).await.map(|_| {
                st.speed = packet.speed;
                st.jog = JogState::Clockwise;
            }),
            CommandCode::JogCcw => self.drive.jog_ccw(speed).await.map(|_| {
                st.speed = packet.speed;
                st.jog = JogState::CounterClockwise;
            }),
            CommandCode::Stop | CommandCode::EmergencyStop => self.drive.stop().await.map(|_| {
                st.speed = 0;
                st.jog = JogState::Stopped;
            }),
            CommandCode::ResetAlarm => self.drive.reset_alarm().await,
        };

        if let Err(e) = result {
            self.events.error(COMPONENT, &format!("{:?} failed: {}", code, e));
        }
    }

    /// Publish the decoded state into the input registers
    fn mirror(&self, st: &ControlState) {
        let [pos_hi, pos_lo] = data_utils::i32_to_registers(st.position);
        let mut status = 0u16;
        if st.drive.alarm {
            status |= map::STATUS_ALARM;
        }
        if st.drive.in_position {
            status |= map::STATUS_IN_POSITION;
        }
        if st.drive.running {
            status |= map::STATUS_RUNNING;
        }
        if st.counter.done {
            status |= map::STATUS_COUNTER_DONE;
        }

        let registers: [u16; map::STATUS_LEN as usize] = [
            pos_hi,
            pos_lo,
            st.speed,
            data_utils::f64_to_tenths(st.temperature),
            data_utils::f64_to_tenths(st.humidity),
            status,
            st.counter.value,
            st.counter.target,
            st.state.code(),
            self.mode(),
            st.step_enabled as u16,
            st.jog.code(),
        ];
        self.bank.write_input_registers(map::IR_POSITION_HI, &registers);
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        let st = self.state.lock().await;
        ControllerSnapshot {
            state: st.state,
            state_text: st.state.as_str(),
            mode: self.mode(),
            auto_enabled: self.auto_enabled(),
            position: st.position,
            speed: st.speed,
            temperature: st.temperature,
            humidity: st.humidity,
            sensor_ok: st.sensor_ok,
            drive: st.drive,
            counter: st.counter,
            step_enabled: st.step_enabled,
            jog: st.jog,
            devices: vec![self.sensor.status(), self.drive.status(), self.counter.status()],
        }
    }

    /// Start the TCP register interface on the configured address
    pub async fn serve_interface(&self) -> CellResult<VirtualSlaveServer> {
        let mut server = VirtualSlaveServer::new(
            VirtualSlaveConfig {
                bind_address: self.config.bind_address.clone(),
                ..VirtualSlaveConfig::default()
            },
            Arc::new(NodeBanks::shared(self.bank.clone())),
        );
        let addr = server.start().await?;
        self.events.info(COMPONENT, &format!("register interface listening on {}", addr));
        Ok(server)
    }

    /// Serve the register interface and run the poll and tick loops forever
    pub async fn run(self: Arc<Self>) -> CellResult<()> {
        self.config.validate()?;
        if !self.transport.open().await {
            self.events.warn(
                COMPONENT,
                &format!("fieldbus {} not available yet, retrying on every poll", self.transport.name()),
            );
        }
        let _server = self.serve_interface().await?;

        let poller = self.clone();
        let poll_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.config.poll_interval());
            loop {
                interval.tick().await;
                if !poller.transport.is_open() && !poller.transport.open().await {
                    continue;
                }
                poller.poll_devices().await;
            }
        });

        let mut interval = tokio::time::interval(self.config.tick_interval());
        loop {
            interval.tick().await;
            self.tick().await;
            if poll_task.is_finished() {
                return Err(CellError::configuration("poll loop terminated"));
            }
        }
    }
}

/// Local panel on the controller itself: writes go straight into its bank
#[async_trait]
impl CellFacade for FieldController {
    type Snapshot = ControllerSnapshot;

    async fn snapshot(&self) -> ControllerSnapshot {
        FieldController::snapshot(self).await
    }

    fn events(&self) -> EventSink {
        self.events.clone()
    }

    async fn current_mode(&self) -> u16 {
        self.mode()
    }

    async fn write_target(&self, target: u16) -> CellResult<()> {
        self.bank.write_holding_register(map::HR_TARGET, target);
        self.events.info(COMPONENT, &format!("local target set to {}", target));
        Ok(())
    }

    async fn write_mode(&self, mode: u16) -> CellResult<()> {
        self.bank.write_holding_register(map::HR_MODE, mode);
        Ok(())
    }

    async fn write_command(&self, packet: CommandPacket) -> CellResult<()> {
        self.bank.write_holding_registers(map::HR_COMMAND, &packet.to_registers());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameTiming, NodeIds, SerialConfig};
    use crate::device::{counter_map, drive_map};
    use crate::simulator::FieldSimulator;
    use crate::transport::SerialTransport;
    use std::time::Duration;
    use tokio::io::duplex;

    async fn cell(config: ControllerConfig) -> (Arc<FieldSimulator>, FieldController) {
        cell_on(Arc::new(FieldSimulator::new(NodeIds::default())), config).await
    }

    async fn cell_on(simulator: Arc<FieldSimulator>, config: ControllerConfig) -> (Arc<FieldSimulator>, FieldController) {
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
        let controller = FieldController::new(config, Arc::new(transport), EventSink::default());
        (simulator, controller)
    }

    /// Counter preset to `value` of `target`, target register already set
    async fn armed(value: u16, target: u16) -> (Arc<FieldSimulator>, FieldController) {
        let (sim, controller) = cell(ControllerConfig::default()).await;
        sim.banks().bank(3).write_holding_register(counter_map::TARGET, target);
        sim.set_counter(value);
        controller.bank().write_holding_register(map::HR_TARGET, target);
        controller.poll_devices().await;
        (sim, controller)
    }

    #[test]
    fn test_state_codes() {
        for code in 0..9 {
            assert_eq!(AutoState::from_code(code).code(), code);
        }
        assert_eq!(AutoState::from_code(42), AutoState::Idle);
        assert_eq!(AutoState::try_from_code(42), None);
        assert_eq!(AutoState::WaitingReset.to_string(), "Waiting reset");
    }

    #[test]
    fn test_command_packet_layout() {
        let packet = CommandPacket::new(CommandCode::MoveAbsolute, CommandSource::Remote, 3)
            .with_motion(-2, 8000);
        assert_eq!(packet.to_registers(), [3, 0xFFFF, 0xFFFE, 8000, 3, 3]);
        assert_eq!(CommandPacket::from_registers(&packet.to_registers()), packet);
        assert_eq!(CommandPacket::from_registers(&[7]).command, 7);
        assert_eq!(CommandCode::from_u16(4), None);
    }

    #[tokio::test]
    async fn test_counter_at_target_starts_one_move() {
        let (sim, controller) = armed(20, 20).await;
        assert_eq!(controller.state().await, AutoState::Idle);

        assert_eq!(controller.tick().await, AutoState::MotorRunning);
        assert_eq!(
            sim.written(2, drive_map::MOVE_INCREMENTAL),
            vec![vec![0, 5000, 0, 8000]]
        );

        // still waiting for in-position, no second move
        assert_eq!(controller.tick().await, AutoState::MotorRunning);
        assert_eq!(sim.written(2, drive_map::MOVE_INCREMENTAL).len(), 1);
    }

    #[tokio::test]
    async fn test_in_position_resets_counter_once() {
        let (sim, controller) = armed(20, 20).await;
        controller.tick().await;

        sim.step();
        controller.poll_devices().await;
        assert_eq!(controller.tick().await, AutoState::MotorRunning);

        sim.step();
        controller.poll_devices().await;
        assert_eq!(controller.tick().await, AutoState::WaitingReset);
        assert_eq!(sim.written(3, counter_map::RESET), vec![vec![1]]);

        // reset not yet observed
        assert_eq!(controller.tick().await, AutoState::WaitingReset);
        assert_eq!(sim.written(3, counter_map::RESET).len(), 1);

        sim.step();
        controller.poll_devices().await;
        assert_eq!(controller.tick().await, AutoState::Idle);
        assert_eq!(controller.tick().await, AutoState::WaitingCount);
        assert_eq!(sim.drive_position(), 5000);
    }

    #[tokio::test]
    async fn test_manual_mode_blocks_automatic_cycle() {
        let (sim, controller) = armed(20, 20).await;
        sim.set_drive_alarm(true);
        controller.poll_devices().await;
        controller.bank().write_holding_register(map::HR_MODE, map::MODE_MANUAL);

        for _ in 0..3 {
            assert_eq!(controller.tick().await, AutoState::Manual);
        }
        assert!(sim.written(2, drive_map::MOVE_INCREMENTAL).is_empty());
        assert!(sim.written(3, counter_map::RESET).is_empty());
        assert_eq!(controller.bank().read_input_register(map::IR_AUTO_STATE), 8);
        assert_eq!(controller.bank().read_input_register(map::IR_MODE), 1);

        // back to auto: the alarm takes over
        controller.bank().write_holding_register(map::HR_MODE, map::MODE_AUTO);
        assert_eq!(controller.tick().await, AutoState::Alarm);
    }

    #[tokio::test]
    async fn test_stop_command_is_consumed_once() {
        let (sim, controller) = cell(ControllerConfig::default()).await;
        let bank = controller.bank();
        bank.write_holding_register(map::HR_MODE, map::MODE_MANUAL);
        let packet = CommandPacket::new(CommandCode::Stop, CommandSource::Remote, 3);
        bank.write_holding_registers(map::HR_COMMAND, &packet.to_registers());

        assert_eq!(controller.tick().await, AutoState::Manual);
        assert_eq!(sim.written(2, drive_map::STOP), vec![vec![1]]);
        assert_eq!(bank.read_holding_register(map::HR_COMMAND), 0);

        controller.tick().await;
        assert_eq!(sim.written(2, drive_map::STOP).len(), 1);
    }

    #[tokio::test]
    async fn test_manual_jog_and_step_are_mirrored() {
        let (sim, controller) = cell(ControllerConfig::default()).await;
        let bank = controller.bank();
        bank.write_holding_register(map::HR_MODE, map::MODE_MANUAL);

        let step_on = CommandPacket::new(CommandCode::StepOn, CommandSource::LocalUi, 2);
        bank.write_holding_registers(map::HR_COMMAND, &step_on.to_registers());
        controller.tick().await;

        let jog = CommandPacket::new(CommandCode::JogCcw, CommandSource::LocalUi, 2).with_motion(0, 1200);
        bank.write_holding_registers(map::HR_COMMAND, &jog.to_registers());
        controller.tick().await;

        assert_eq!(sim.written(2, drive_map::STEP_ENABLE), vec![vec![1]]);
        assert_eq!(sim.written(2, drive_map::JOG), vec![vec![0, 1200, 0, drive_map::JOG_CCW]]);
        assert_eq!(bank.read_input_register(map::IR_STEP_ENABLED), 1);
        assert_eq!(bank.read_input_register(map::IR_JOG_STATE), JogState::CounterClockwise.code());
        assert_eq!(bank.read_input_register(map::IR_SPEED), 1200);
    }

    #[tokio::test]
    async fn test_target_change_is_forwarded_once() {
        let (sim, controller) = cell(ControllerConfig::default()).await;
        assert_eq!(controller.tick().await, AutoState::WaitingTarget);

        controller.bank().write_holding_register(map::HR_TARGET, 50);
        assert_eq!(controller.tick().await, AutoState::WaitingCount);
        controller.tick().await;
        assert_eq!(sim.written(3, counter_map::TARGET), vec![vec![50]]);
        assert_eq!(sim.counter().1, 50);
        assert_eq!(controller.bank().read_input_register(map::IR_COUNTER_TARGET), 50);
    }

    #[tokio::test]
    async fn test_alarm_is_logged_once() {
        let (sim, controller) = armed(3, 20).await;
        sim.set_drive_alarm(true);
        controller.poll_devices().await;

        assert_eq!(controller.tick().await, AutoState::Alarm);
        assert_eq!(controller.tick().await, AutoState::Alarm);
        let alarms = controller
            .events()
            .recent_lines()
            .iter()
            .filter(|line| line.contains("driver alarm"))
            .count();
        assert_eq!(alarms, 1);
        assert_eq!(
            controller.bank().read_input_register(map::IR_STATUS) & map::STATUS_ALARM,
            map::STATUS_ALARM
        );
    }

    #[tokio::test]
    async fn test_motor_timeout_holds_until_target_changes() {
        let config = ControllerConfig {
            motor_timeout_ms: 50,
            ..ControllerConfig::default()
        };
        let (sim, controller) = cell(config).await;
        sim.banks().bank(3).write_holding_register(counter_map::TARGET, 20);
        sim.set_counter(20);
        controller.bank().write_holding_register(map::HR_TARGET, 20);
        controller.poll_devices().await;

        assert_eq!(controller.tick().await, AutoState::MotorRunning);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(controller.tick().await, AutoState::TimeoutMotor);
        assert_eq!(controller.tick().await, AutoState::TimeoutMotor);
        assert_eq!(sim.written(2, drive_map::MOVE_INCREMENTAL).len(), 1);

        controller.bank().write_holding_register(map::HR_TARGET, 30);
        assert_eq!(controller.tick().await, AutoState::WaitingCount);
    }

    #[tokio::test]
    async fn test_disabled_and_mirror() {
        let (_sim, controller) = armed(20, 20).await;
        controller.set_auto_enabled(false);
        assert_eq!(controller.tick().await, AutoState::Disabled);

        let bank = controller.bank();
        assert_eq!(bank.read_input_register(map::IR_TEMPERATURE), 250);
        assert_eq!(bank.read_input_register(map::IR_HUMIDITY), 600);
        assert_eq!(bank.read_input_register(map::IR_COUNTER_VALUE), 20);
        assert_eq!(bank.read_input_register(map::IR_AUTO_STATE), AutoState::Disabled.code());
        assert_eq!(
            bank.read_input_register(map::IR_STATUS),
            map::STATUS_IN_POSITION | map::STATUS_COUNTER_DONE
        );

        let snapshot = controller.snapshot().await;
        assert!(!snapshot.auto_enabled);
        assert!(snapshot.sensor_ok);
        assert_eq!(snapshot.devices.len(), 3);
        assert!(snapshot.devices.iter().all(|d| d.connected));
    }

    #[tokio::test]
    async fn test_local_panel_needs_manual_mode() {
        let (sim, controller) = cell(ControllerConfig::default()).await;
        let err = controller.move_absolute(1000, 500).await.unwrap_err();
        assert!(matches!(err, CellError::Rejected { .. }));
        assert!(controller.set_target(0).await.is_err());

        controller.set_target(12).await.unwrap();
        controller.set_mode(map::MODE_MANUAL).await.unwrap();
        controller.move_absolute(-1000, 70_000).await.unwrap();
        assert_eq!(
            controller.bank().read_holding_registers(map::HR_COMMAND, map::COMMAND_LEN),
            vec![3, 0xFFFF, 0xFC18, 0xFFFF, 2, 2]
        );

        controller.tick().await;
        assert_eq!(sim.written(2, drive_map::MOVE_ABSOLUTE), vec![vec![0xFFFF, 0xFC18, 0, 0xFFFF]]);
        assert_eq!(controller.bank().read_holding_register(map::HR_TARGET), 12);
    }

    #[tokio::test]
    async fn test_status_read_overtaken_by_move_is_dropped() {
        let simulator = Arc::new(
            FieldSimulator::new(NodeIds::default()).with_response_delay(Duration::from_millis(50)),
        );
        let (sim, controller) = cell_on(simulator, ControllerConfig::default()).await;
        let controller = Arc::new(controller);
        sim.banks().bank(3).write_holding_register(counter_map::TARGET, 20);
        sim.set_counter(19);
        controller.bank().write_holding_register(map::HR_TARGET, 20);
        controller.poll_devices().await;
        assert_eq!(controller.tick().await, AutoState::WaitingCount);

        sim.set_counter(20);
        controller.poll_devices().await;
        assert!(controller.snapshot().await.drive.in_position);

        // the move is issued while this poll's status read is on the wire
        let poll = tokio::spawn({
            let controller = controller.clone();
            async move { controller.poll_devices().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.tick().await, AutoState::MotorRunning);
        poll.await.unwrap();
        assert!(!controller.snapshot().await.drive.in_position);

        sim.step();
        controller.poll_devices().await;
        assert_eq!(controller.tick().await, AutoState::MotorRunning);
        assert!(sim.written(3, counter_map::RESET).is_empty());
        assert_eq!(sim.written(2, drive_map::MOVE_INCREMENTAL).len(), 1);
    }
}
