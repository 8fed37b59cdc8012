//! Supervisory bridge between the field controller and the operator tier.
//!
//! The bridge is a Modbus TCP client of the controller's register interface
//! and a TCP server for exactly one operator connection speaking
//! newline-delimited JSON. Every controller poll decodes the twelve mirrored
//! input registers into a [`BridgeStatus`] and pushes it upstream as
//!
//! ```text
//! {"type":"status","timestamp":1700000000.123,"data":{...}}
//! ```
//!
//! Operator lines look like
//!
//! ```text
//! {"type":"jog_control","source":"remote","priority":3,"data":{"speed":1200,"direction":1}}
//! ```
//!
//! and are translated into target, mode or command-packet writes on the
//! controller. A newer operator connection replaces the current one.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use crate::config::{controller_map as map, BridgeConfig};
use crate::controller::{AutoState, CommandCode, CommandPacket, CommandSource};
use crate::error::{CellError, CellResult};
use crate::facade::{CellFacade, RELEASE_PRIORITY};
use crate::logging::EventSink;
use crate::protocol::{data_utils, ModbusRequest};
use crate::transport::{FieldTransport, TcpTransport};

const COMPONENT: &str = "Bridge";

/// Command types accepted from the operator tier
pub const OPERATOR_COMMANDS: [&str; 7] = [
    "motor_control",
    "jog_control",
    "stop_motor",
    "release_control",
    "emergency_stop",
    "set_target",
    "set_mode",
];

/// Speed used for an absolute move when neither the command nor the last
/// poll supplies one
pub const FALLBACK_MOVE_SPEED: i64 = 1000;

/// Text for a mirrored state code
pub fn auto_state_text(code: u16) -> &'static str {
    AutoState::try_from_code(code).map_or("Unknown", AutoState::as_str)
}

pub fn mode_text(mode: u16) -> &'static str {
    match mode {
        map::MODE_AUTO => "Auto",
        map::MODE_MANUAL => "Manual",
        _ => "Unknown",
    }
}

/// Controller status as seen by the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub position: i32,
    pub speed: u16,
    pub temperature: f64,
    pub humidity: f64,
    pub driver_alarm: bool,
    pub driver_inpos: bool,
    pub driver_running: bool,
    pub counter_done: bool,
    pub counter_value: u16,
    pub counter_target: u16,
    pub auto_state_code: u16,
    pub auto_state_text: String,
    pub mode: u16,
    pub mode_text: String,
    pub step_enabled: bool,
    pub jog_state: u16,
    /// Temperature and humidity are held at their last value while false
    pub sensor_enabled: bool,
    pub controller_connected: bool,
    pub status_updates: u64,
    pub commands_forwarded: u64,
    pub commands_from_operator: u64,
    pub last_update: Option<String>,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            position: 0,
            speed: 0,
            temperature: 0.0,
            humidity: 0.0,
            driver_alarm: false,
            driver_inpos: false,
            driver_running: false,
            counter_done: false,
            counter_value: 0,
            counter_target: 0,
            auto_state_code: AutoState::Idle.code(),
            auto_state_text: AutoState::Idle.as_str().to_string(),
            mode: map::MODE_AUTO,
            mode_text: mode_text(map::MODE_AUTO).to_string(),
            step_enabled: false,
            jog_state: 0,
            sensor_enabled: true,
            controller_connected: false,
            status_updates: 0,
            commands_forwarded: 0,
            commands_from_operator: 0,
            last_update: None,
        }
    }
}

impl BridgeStatus {
    /// Decode the mirrored input block `IR0..IR11`
    pub fn apply_registers(&mut self, regs: &[u16]) -> CellResult<()> {
        if regs.len() < map::STATUS_LEN as usize {
            return Err(CellError::malformed(format!(
                "status block has {} registers, expected {}",
                regs.len(),
                map::STATUS_LEN
            )));
        }
        let reg = |address: u16| regs[address as usize];

        self.position = data_utils::registers_to_i32(reg(map::IR_POSITION_HI), reg(map::IR_POSITION_LO));
        self.speed = reg(map::IR_SPEED);
        if self.sensor_enabled {
            self.temperature = data_utils::tenths_to_f64(reg(map::IR_TEMPERATURE));
            self.humidity = data_utils::tenths_to_f64(reg(map::IR_HUMIDITY));
        }

        let status = reg(map::IR_STATUS);
        self.driver_alarm = status & map::STATUS_ALARM != 0;
        self.driver_inpos = status & map::STATUS_IN_POSITION != 0;
        self.driver_running = status & map::STATUS_RUNNING != 0;
        self.counter_done = status & map::STATUS_COUNTER_DONE != 0;

        self.counter_value = reg(map::IR_COUNTER_VALUE);
        self.counter_target = reg(map::IR_COUNTER_TARGET);
        self.auto_state_code = reg(map::IR_AUTO_STATE);
        self.auto_state_text = auto_state_text(self.auto_state_code).to_string();
        self.mode = reg(map::IR_MODE);
        self.mode_text = mode_text(self.mode).to_string();
        self.step_enabled = reg(map::IR_STEP_ENABLED) != 0;
        self.jog_state = reg(map::IR_JOG_STATE);
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: f64,
    data: &'a BridgeStatus,
}

/// One line received from the operator tier
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub priority: Option<u16>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub data: Value,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> CellResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn source_label(&self) -> &str {
        self.source.as_deref().unwrap_or("remote")
    }

    /// Integer field of `data`; numeric strings are accepted
    pub fn int_field(&self, key: &str) -> CellResult<Option<i64>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| CellError::rejected(format!("{} is out of range", key))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| CellError::rejected(format!("{} is not an integer: {:?}", key, s))),
            Some(other) => Err(CellError::rejected(format!("{} is not an integer: {}", key, other))),
        }
    }

    pub fn bool_field(&self, key: &str) -> bool {
        match self.data.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            _ => false,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Source tag for a free-form label sent by the operator tier
pub fn source_for_label(label: &str) -> CommandSource {
    let label = label.to_ascii_lowercase();
    if label.contains("remote") || label.contains("operator") || label.contains("layer_c") {
        CommandSource::Remote
    } else {
        CommandSource::LocalUi
    }
}

fn to_position(value: i64) -> CellResult<i32> {
    i32::try_from(value).map_err(|_| CellError::rejected(format!("position {} does not fit 32 bits", value)))
}

struct OperatorLink {
    id: u64,
    peer: SocketAddr,
    // status lines for the link's writer task
    outbox: mpsc::Sender<String>,
    // dropping the sender stops the link's reader task
    _cancel: oneshot::Sender<()>,
}

/// Supervisory bridge
pub struct SupervisoryBridge {
    config: BridgeConfig,
    transport: Arc<dyn FieldTransport>,
    events: EventSink,
    status: Mutex<BridgeStatus>,
    history: Mutex<VecDeque<String>>,
    operator: tokio::sync::Mutex<Option<OperatorLink>>,
    next_link_id: AtomicU64,
    connected: AtomicBool,
}

impl SupervisoryBridge {
    pub fn new(config: BridgeConfig, events: EventSink) -> Self {
        let transport = Arc::new(TcpTransport::new(config.controller.clone()));
        Self::with_transport(config, transport, events)
    }

    pub fn with_transport(config: BridgeConfig, transport: Arc<dyn FieldTransport>, events: EventSink) -> Self {
        Self {
            config,
            transport,
            events,
            status: Mutex::new(BridgeStatus::default()),
            history: Mutex::new(VecDeque::new()),
            operator: tokio::sync::Mutex::new(None),
            next_link_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn status(&self) -> MutexGuard<'_, BridgeStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status_snapshot(&self) -> BridgeStatus {
        self.status().clone()
    }

    /// Operator commands seen most recently, oldest first
    pub fn command_history(&self) -> Vec<String> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub async fn operator_connected(&self) -> bool {
        self.operator.lock().await.is_some()
    }

    /// Hold (false) or resume (true) temperature and humidity updates
    pub fn set_sensor_enabled(&self, enabled: bool) {
        self.status().sensor_enabled = enabled;
        let text = if enabled { "resumed" } else { "held" };
        self.events.info(COMPONENT, &format!("sensor values {}", text));
    }

    pub fn toggle_sensor(&self) -> bool {
        let enabled = !self.status().sensor_enabled;
        self.set_sensor_enabled(enabled);
        enabled
    }

    fn set_connected(&self, connected: bool, reason: &str) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            if connected {
                self.events.info(COMPONENT, &format!("connected to controller at {}", self.config.controller.address));
            } else {
                self.events.warn(COMPONENT, &format!("controller link lost: {}", reason));
            }
        }
        self.status().controller_connected = connected;
    }

    async fn ensure_connected(&self) -> CellResult<()> {
        if self.transport.is_open() {
            return Ok(());
        }
        if self.transport.open().await {
            self.set_connected(true, "");
            Ok(())
        } else {
            let err = CellError::connection(format!(
                "cannot reach controller at {}",
                self.config.controller.address
            ));
            self.set_connected(false, &err.to_string());
            Err(err)
        }
    }

    async fn send(&self, request: ModbusRequest) -> CellResult<Vec<u16>> {
        self.ensure_connected().await?;
        match self.transport.request(&request).await {
            Ok(response) => Ok(response.registers().to_vec()),
            Err(e) => {
                if e.is_transport_error() {
                    self.set_connected(false, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Read the controller's status block and push it to the operator
    pub async fn poll_controller(&self) -> CellResult<BridgeStatus> {
        let registers = self
            .send(ModbusRequest::read_input(
                self.config.controller_unit_id,
                map::IR_POSITION_HI,
                map::STATUS_LEN,
            ))
            .await?;

        let snapshot = {
            let mut status = self.status();
            status.apply_registers(&registers)?;
            status.status_updates += 1;
            status.last_update = Some(Local::now().format("%H:%M:%S%.3f").to_string());
            status.clone()
        };
        self.push_status(&snapshot).await;
        Ok(snapshot)
    }

    async fn push_status(&self, status: &BridgeStatus) {
        let message = StatusMessage {
            kind: "status",
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            data: status,
        };
        let line = match serde_json::to_string(&message) {
            Ok(json) => json + "\n",
            Err(e) => {
                self.events.error(COMPONENT, &format!("status encoding failed: {}", e));
                return;
            }
        };

        let slot = self.operator.lock().await;
        if let Some(link) = slot.as_ref() {
            match link.outbox.try_send(line) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    self.events.debug(COMPONENT, &format!("operator {} lagging, status frame dropped", link.peer));
                }
            }
        }
    }

    /// Remove the operator link if it is still the current one
    async fn detach_operator(&self, id: u64) -> bool {
        let mut slot = self.operator.lock().await;
        if slot.as_ref().map_or(false, |link| link.id == id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Handle one newline-delimited JSON object from the operator tier
    ///
    /// Failures are logged here; the operator connection stays up whatever
    /// the outcome.
    pub async fn handle_operator_line(&self, line: &str) -> CellResult<()> {
        let command = match OperatorCommand::parse(line) {
            Ok(command) => command,
            Err(e) => {
                self.events.warn(COMPONENT, &format!("JSON error from operator: {}", e));
                return Err(e);
            }
        };
        if command.kind == "heartbeat" {
            return Ok(());
        }

        self.status().commands_from_operator += 1;
        self.record_history(&command);
        self.events.info(COMPONENT, &format!("received from operator: {}", command.kind));

        if !OPERATOR_COMMANDS.contains(&command.kind.as_str()) {
            let err = CellError::rejected(format!("unsupported command '{}'", command.kind));
            self.events.warn(COMPONENT, &err.to_string());
            return Err(err);
        }

        let result = self.execute_operator_command(&command).await;
        if let Err(e) = &result {
            self.events.warn(COMPONENT, &format!("{} from {} failed: {}", command.kind, command.source_label(), e));
        }
        result
    }

    fn record_history(&self, command: &OperatorCommand) {
        let entry = format!(
            "[{}] {} -> {}",
            Local::now().format("%H:%M:%S"),
            command.source_label(),
            command.kind
        );
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(entry);
        while history.len() > self.config.command_history {
            history.pop_front();
        }
    }

    async fn execute_operator_command(&self, command: &OperatorCommand) -> CellResult<()> {
        let source = source_for_label(command.source_label());
        let priority = command.priority.unwrap_or_else(|| source.default_priority());
        let packet = |code: CommandCode| CommandPacket::new(code, source, priority);

        match command.kind.as_str() {
            "set_target" => {
                let target = command.int_field("target")?.unwrap_or(0);
                let target = u16::try_from(target)
                    .map_err(|_| CellError::rejected(format!("target {} out of 16-bit range", target)))?;
                self.write_target(target).await
            }
            "set_mode" => {
                let mode = command.int_field("mode")?.unwrap_or(0);
                match u16::try_from(mode) {
                    Ok(mode) if mode == map::MODE_AUTO || mode == map::MODE_MANUAL => self.write_mode(mode).await,
                    _ => Err(CellError::rejected(format!("mode {} must be 0 or 1", mode))),
                }
            }
            "motor_control" => {
                let packet = match command.str_field("step_command") {
                    Some("on") => packet(CommandCode::StepOn),
                    Some("off") => packet(CommandCode::StepOff),
                    _ if command.bool_field("alarm_reset") => packet(CommandCode::ResetAlarm),
                    _ => {
                        let (current_position, current_speed) = {
                            let status = self.status();
                            (status.position, status.speed)
                        };
                        let position = match command.int_field("position")? {
                            Some(position) => to_position(position)?,
                            None => current_position,
                        };
                        let speed = command.int_field("speed")?.unwrap_or(if current_speed > 0 {
                            current_speed as i64
                        } else {
                            FALLBACK_MOVE_SPEED
                        });
                        packet(CommandCode::MoveAbsolute)
                            .with_motion(position, CommandPacket::register_speed(speed, &self.events))
                    }
                };
                self.write_command(packet).await
            }
            "jog_control" => {
                let speed = command.int_field("speed")?.unwrap_or(0);
                let direction = command.int_field("direction")?.unwrap_or(1);
                let code = if direction > 0 { CommandCode::JogCw } else { CommandCode::JogCcw };
                self.write_command(packet(code).with_motion(0, CommandPacket::register_speed(speed, &self.events)))
                    .await
            }
            "stop_motor" => self.write_command(packet(CommandCode::Stop)).await,
            "release_control" => {
                self.write_command(CommandPacket::new(
                    CommandCode::Stop,
                    CommandSource::LocalUi,
                    RELEASE_PRIORITY,
                ))
                .await
            }
            "emergency_stop" => self.write_command(packet(CommandCode::EmergencyStop)).await,
            other => Err(CellError::rejected(format!("unsupported command '{}'", other))),
        }
    }

    /// Bind the operator listener and accept connections in the background
    pub async fn serve_operators(self: &Arc<Self>) -> CellResult<SocketAddr> {
        let listener = TcpListener::bind(&self.config.operator_bind_address)
            .await
            .map_err(|e| CellError::connection(format!("bind {}: {}", self.config.operator_bind_address, e)))?;
        let addr = listener.local_addr()?;
        self.events.info(COMPONENT, &format!("operator listener on {}", addr));

        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => bridge.clone().attach_operator(stream, peer).await,
                    Err(e) => bridge.events.error(COMPONENT, &format!("operator accept failed: {}", e)),
                }
            }
        });
        Ok(addr)
    }

    async fn attach_operator(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (outbox, outbox_rx) = mpsc::channel(self.config.operator_queue.max(1));

        let previous = self.operator.lock().await.replace(OperatorLink {
            id,
            peer,
            outbox,
            _cancel: cancel_tx,
        });
        if let Some(old) = previous {
            self.events.info(COMPONENT, &format!("operator {} replaced by {}", old.peer, peer));
        }
        self.events.info(COMPONENT, &format!("operator connected: {}", peer));

        tokio::spawn(self.clone().write_operator(id, peer, writer, outbox_rx));
        tokio::spawn(self.read_operator(id, peer, reader, cancel_rx));
    }

    /// Drain queued status lines onto the socket
    ///
    /// Ends when the link is replaced (the queue closes) or a write fails or
    /// stalls past the configured timeout, which also drops the link.
    async fn write_operator(
        self: Arc<Self>,
        id: u64,
        peer: SocketAddr,
        mut writer: OwnedWriteHalf,
        mut outbox: mpsc::Receiver<String>,
    ) {
        let limit = self.config.operator_write_timeout();
        while let Some(line) = outbox.recv().await {
            let failure = match tokio::time::timeout(limit, writer.write_all(line.as_bytes())).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("write stalled for {:?}", limit),
            };
            self.events.warn(COMPONENT, &format!("send to operator {} failed: {}", peer, failure));
            self.detach_operator(id).await;
            break;
        }
    }

    async fn read_operator(
        self: Arc<Self>,
        id: u64,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            let _ = self.handle_operator_line(line.trim()).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.events.warn(COMPONENT, &format!("error from operator {}: {}", peer, e));
                        break;
                    }
                },
            }
        }

        self.detach_operator(id).await;
        self.events.info(COMPONENT, &format!("operator {} disconnected", peer));
    }

    /// Serve operators and poll the controller forever
    pub async fn run(self: Arc<Self>) -> CellResult<()> {
        self.config.validate()?;
        self.serve_operators().await?;
        let mut interval = tokio::time::interval(self.config.poll_interval());
        loop {
            interval.tick().await;
            if let Err(e) = self.poll_controller().await {
                self.events.debug(COMPONENT, &format!("poll failed: {}", e));
            }
        }
    }
}

#[async_trait]
impl CellFacade for SupervisoryBridge {
    type Snapshot = BridgeStatus;

    async fn snapshot(&self) -> BridgeStatus {
        self.status_snapshot()
    }

    fn events(&self) -> EventSink {
        self.events.clone()
    }

    async fn current_mode(&self) -> u16 {
        self.status().mode
    }

    async fn write_target(&self, target: u16) -> CellResult<()> {
        self.send(ModbusRequest::write_single(self.config.controller_unit_id, map::HR_TARGET, target))
            .await?;
        self.status().commands_forwarded += 1;
        self.events.info(COMPONENT, &format!("target {} written to controller", target));
        Ok(())
    }

    async fn write_mode(&self, mode: u16) -> CellResult<()> {
        self.send(ModbusRequest::write_single(self.config.controller_unit_id, map::HR_MODE, mode))
            .await?;
        self.status().commands_forwarded += 1;
        self.events.info(COMPONENT, &format!("mode {} ({}) written to controller", mode, mode_text(mode)));
        Ok(())
    }

    async fn write_command(&self, packet: CommandPacket) -> CellResult<()> {
        let registers = packet.to_registers();
        self.send(ModbusRequest::write_multiple(
            self.config.controller_unit_id,
            map::HR_COMMAND,
            &registers,
        ))
        .await?;
        self.status().commands_forwarded += 1;
        self.events.info(
            COMPONENT,
            &format!(
                "command {} sent to controller (source {}, priority {})",
                packet.command,
                CommandSource::from_u16(packet.source),
                packet.priority
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpClientConfig;
    use crate::register_bank::ModbusRegisterBank;
    use crate::server::{ModbusServer, NodeBanks, VirtualSlaveConfig, VirtualSlaveServer};
    use tokio::net::TcpStream;

    /// Bridge wired to a register bank served on a loopback port
    async fn rig() -> (Arc<ModbusRegisterBank>, VirtualSlaveServer, Arc<SupervisoryBridge>) {
        let bank = Arc::new(ModbusRegisterBank::new());
        let mut server = VirtualSlaveServer::new(
            VirtualSlaveConfig {
                bind_address: "127.0.0.1:0".to_string(),
                ..VirtualSlaveConfig::default()
            },
            Arc::new(NodeBanks::shared(bank.clone())),
        );
        let addr = server.start().await.unwrap();
        let config = BridgeConfig {
            controller: TcpClientConfig {
                address: addr.to_string(),
                ..TcpClientConfig::default()
            },
            operator_bind_address: "127.0.0.1:0".to_string(),
            ..BridgeConfig::default()
        };
        let bridge = Arc::new(SupervisoryBridge::new(config, EventSink::default()));
        (bank, server, bridge)
    }

    #[test]
    fn test_status_decoding() {
        let mut status = BridgeStatus::default();
        let regs = [0xFFFF, 0xFF38, 8000, 0xFF9C, 455, 0b1011, 7, 20, 2, 1, 1, 2];
        status.apply_registers(&regs).unwrap();
        assert_eq!(status.position, -200);
        assert_eq!(status.temperature, -10.0);
        assert_eq!(status.humidity, 45.5);
        assert!(status.driver_alarm && status.driver_inpos && !status.driver_running);
        assert!(status.counter_done);
        assert_eq!(status.auto_state_text, "Motor running");
        assert_eq!(status.mode_text, "Manual");
        assert_eq!(status.jog_state, 2);

        status.sensor_enabled = false;
        let mut held = regs;
        held[3] = 300;
        status.apply_registers(&held).unwrap();
        assert_eq!(status.temperature, -10.0);

        assert!(status.apply_registers(&regs[..5]).is_err());
        assert_eq!(auto_state_text(42), "Unknown");
    }

    #[test]
    fn test_operator_command_fields() {
        let command = OperatorCommand::parse(
            r#"{"type":"motor_control","data":{"position":"-500","speed":1200.0,"alarm_reset":1}}"#,
        )
        .unwrap();
        assert_eq!(command.int_field("position").unwrap(), Some(-500));
        assert_eq!(command.int_field("speed").unwrap(), Some(1200));
        assert_eq!(command.int_field("missing").unwrap(), None);
        assert!(command.bool_field("alarm_reset"));
        assert_eq!(command.source_label(), "remote");

        let bare = OperatorCommand::parse(r#"{"type":"stop_motor"}"#).unwrap();
        assert_eq!(bare.int_field("speed").unwrap(), None);
        assert!(OperatorCommand::parse("not json").is_err());
        assert_eq!(source_for_label("Layer_C"), CommandSource::Remote);
        assert_eq!(source_for_label("panel"), CommandSource::LocalUi);
    }

    #[tokio::test]
    async fn test_set_target_writes_holding_register() {
        let (bank, _server, bridge) = rig().await;
        bridge
            .handle_operator_line(r#"{"type":"set_target","data":{"target":50}}"#)
            .await
            .unwrap();
        assert_eq!(bank.read_holding_register(map::HR_TARGET), 50);

        let err = bridge
            .handle_operator_line(r#"{"type":"set_target","data":{"target":70000}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, CellError::Rejected { .. }));
        assert_eq!(bank.read_holding_register(map::HR_TARGET), 50);

        let status = bridge.status_snapshot();
        assert_eq!(status.commands_from_operator, 2);
        assert_eq!(status.commands_forwarded, 1);
    }

    #[tokio::test]
    async fn test_operator_commands_map_to_packets() {
        let (bank, _server, bridge) = rig().await;
        let packet = || bank.read_holding_registers(map::HR_COMMAND, map::COMMAND_LEN);

        bridge
            .handle_operator_line(r#"{"type":"jog_control","data":{"speed":1200,"direction":-1}}"#)
            .await
            .unwrap();
        assert_eq!(packet(), vec![6, 0, 0, 1200, 3, 3]);

        bridge
            .handle_operator_line(r#"{"type":"motor_control","priority":5,"data":{"position":70000}}"#)
            .await
            .unwrap();
        assert_eq!(packet(), vec![3, 1, 4464, 1000, 3, 5]);

        bridge
            .handle_operator_line(r#"{"type":"motor_control","data":{"step_command":"on"}}"#)
            .await
            .unwrap();
        assert_eq!(packet()[0], 1);

        bridge
            .handle_operator_line(r#"{"type":"release_control"}"#)
            .await
            .unwrap();
        assert_eq!(packet(), vec![7, 0, 0, 0, 2, 1]);

        bridge
            .handle_operator_line(r#"{"type":"emergency_stop","source":"panel"}"#)
            .await
            .unwrap();
        assert_eq!(packet(), vec![9, 0, 0, 0, 2, 2]);
    }

    #[tokio::test]
    async fn test_heartbeat_and_unknown_commands() {
        let (bank, _server, bridge) = rig().await;
        bridge.handle_operator_line(r#"{"type":"heartbeat"}"#).await.unwrap();
        assert_eq!(bridge.status_snapshot().commands_from_operator, 0);

        let err = bridge.handle_operator_line(r#"{"type":"self_destruct"}"#).await.unwrap_err();
        assert!(matches!(err, CellError::Rejected { .. }));
        assert_eq!(bridge.status_snapshot().commands_from_operator, 1);
        assert_eq!(bridge.command_history().len(), 1);
        assert!(bridge.command_history()[0].ends_with("remote -> self_destruct"));
        assert_eq!(bank.get_stats().holding_registers_set, 0);
        assert!(bridge.handle_operator_line("{broken").await.is_err());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (_bank, _server, bridge) = rig().await;
        for _ in 0..15 {
            let _ = bridge.handle_operator_line(r#"{"type":"noop"}"#).await;
        }
        assert_eq!(bridge.command_history().len(), 10);
    }

    #[tokio::test]
    async fn test_poll_pushes_status_to_operator() {
        let (bank, _server, bridge) = rig().await;
        bank.write_input_registers(0, &[0, 5000, 8000, 253, 612, 0b0010, 3, 20, 1, 0, 1, 0]);
        let addr = bridge.serve_operators().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        for _ in 0..50 {
            if bridge.operator_connected().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let status = bridge.poll_controller().await.unwrap();
        assert_eq!(status.position, 5000);
        assert!(status.controller_connected);

        let line = lines.next_line().await.unwrap().unwrap();
        let message: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(message["type"], "status");
        assert_eq!(message["data"]["counter_target"], 20);
        assert_eq!(message["data"]["auto_state_text"], "Waiting count");
        assert_eq!(message["data"]["temperature"], 25.3);
        assert_eq!(message["data"].as_object().unwrap().len(), 22);
    }

    #[tokio::test]
    async fn test_local_panel_rules() {
        let (bank, _server, bridge) = rig().await;
        bridge.poll_controller().await.unwrap();
        let err = bridge.stop().await.unwrap_err();
        assert!(matches!(err, CellError::Rejected { .. }));
        assert!(bridge.set_target(0).await.is_err());
        assert!(bridge.set_mode(4).await.is_err());

        bridge.set_mode(map::MODE_MANUAL).await.unwrap();
        bank.write_input_register(map::IR_MODE, map::MODE_MANUAL);
        bridge.poll_controller().await.unwrap();

        assert!(bridge.move_absolute(3_000_000_000, 100).await.is_err());
        assert!(bridge.jog(crate::facade::JogDirection::Clockwise, 0).await.is_err());
        bridge.move_absolute(1000, 500).await.unwrap();
        assert_eq!(
            bank.read_holding_registers(map::HR_COMMAND, map::COMMAND_LEN),
            vec![3, 0, 1000, 500, 2, 2]
        );
        assert_eq!(bank.read_holding_register(map::HR_MODE), 1);
    }

    #[tokio::test]
    async fn test_unreachable_controller() {
        let config = BridgeConfig {
            controller: TcpClientConfig {
                address: "127.0.0.1:1".to_string(),
                connect_timeout_ms: 200,
                ..TcpClientConfig::default()
            },
            ..BridgeConfig::default()
        };
        let bridge = SupervisoryBridge::new(config, EventSink::default());
        assert!(bridge.poll_controller().await.is_err());
        assert!(!bridge.status_snapshot().controller_connected);
        assert!(!bridge.toggle_sensor());
    }

    #[tokio::test]
    async fn test_stalled_operator_is_dropped_without_blocking_polls() {
        let (_bank, _server, bridge) = rig().await;
        let config = BridgeConfig {
            operator_write_timeout_ms: 100,
            ..bridge.config().clone()
        };
        let bridge = Arc::new(SupervisoryBridge::new(config, EventSink::default()));
        let addr = bridge.serve_operators().await.unwrap();

        // connects and never reads
        let _stalled = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if bridge.operator_connected().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(bridge.operator_connected().await);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(20), async {
            for _ in 0..200_000u32 {
                bridge.poll_controller().await.unwrap();
                if !bridge.operator_connected().await {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(outcome, Ok(true));

        let (reader, _writer) = TcpStream::connect(addr).await.unwrap().into_split();
        for _ in 0..100 {
            if bridge.operator_connected().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        bridge.poll_controller().await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = tokio::time::timeout(std::time::Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(line.contains("\"status\""));
    }
}
