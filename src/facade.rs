//! Narrow control surface for a presentation layer.
//!
//! A front end only ever needs a state snapshot, the shared event sink and a
//! handful of command calls that either succeed or explain why not. Both the
//! field controller and the supervisory bridge implement [`CellFacade`], so a
//! local panel can drive either tier (or run headless in tests) through the
//! same calls.
//!
//! Motion commands are only accepted while the controller reports manual
//! mode. Configuration writes (target, mode) are always allowed.

use async_trait::async_trait;
use serde::Serialize;

use crate::config::controller_map as map;
use crate::controller::{CommandCode, CommandPacket, CommandSource};
use crate::error::{CellError, CellResult};
use crate::logging::EventSink;
use crate::utils::validation;

/// Jog direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JogDirection {
    Clockwise,
    CounterClockwise,
}

impl JogDirection {
    pub fn command(self) -> CommandCode {
        match self {
            JogDirection::Clockwise => CommandCode::JogCw,
            JogDirection::CounterClockwise => CommandCode::JogCcw,
        }
    }
}

/// Priority stamped on local panel commands
pub const LOCAL_PRIORITY: u16 = 2;

/// Priority stamped when control is handed back to the local panel
pub const RELEASE_PRIORITY: u16 = 1;

/// Control surface of one tier
#[async_trait]
pub trait CellFacade: Send + Sync {
    type Snapshot: Serialize + Send;

    /// Current state, as last polled
    async fn snapshot(&self) -> Self::Snapshot;

    fn events(&self) -> EventSink;

    /// Mode register as currently known (0 auto, 1 manual)
    async fn current_mode(&self) -> u16;

    async fn write_target(&self, target: u16) -> CellResult<()>;

    async fn write_mode(&self, mode: u16) -> CellResult<()>;

    async fn write_command(&self, packet: CommandPacket) -> CellResult<()>;

    /// Set the counter target; the panel accepts 1..=65535
    async fn set_target(&self, target: i64) -> CellResult<()> {
        if target <= 0 {
            return Err(CellError::rejected("target must be 1..65535"));
        }
        let target = validation::validate_target(target).map_err(|e| CellError::rejected(e.to_string()))?;
        self.write_target(target).await
    }

    async fn set_mode(&self, mode: u16) -> CellResult<()> {
        if mode != map::MODE_AUTO && mode != map::MODE_MANUAL {
            return Err(CellError::rejected(format!("mode {} must be 0 (auto) or 1 (manual)", mode)));
        }
        self.write_mode(mode).await
    }

    async fn step_on(&self) -> CellResult<()> {
        self.manual_command(CommandCode::StepOn, 0, 0, LOCAL_PRIORITY).await
    }

    async fn step_off(&self) -> CellResult<()> {
        self.manual_command(CommandCode::StepOff, 0, 0, LOCAL_PRIORITY).await
    }

    async fn reset_alarm(&self) -> CellResult<()> {
        self.manual_command(CommandCode::ResetAlarm, 0, 0, LOCAL_PRIORITY).await
    }

    async fn stop(&self) -> CellResult<()> {
        self.manual_command(CommandCode::Stop, 0, 0, LOCAL_PRIORITY).await
    }

    async fn emergency_stop(&self) -> CellResult<()> {
        self.manual_command(CommandCode::EmergencyStop, 0, 0, LOCAL_PRIORITY).await
    }

    /// Stop the motor and hand control back to the local panel
    async fn release_control(&self) -> CellResult<()> {
        self.manual_command(CommandCode::Stop, 0, 0, RELEASE_PRIORITY).await
    }

    async fn move_absolute(&self, position: i64, speed: i64) -> CellResult<()> {
        let position = validation::validate_position(position).map_err(|e| CellError::rejected(e.to_string()))?;
        let speed = validation::validate_speed(speed).map_err(|e| CellError::rejected(e.to_string()))?;
        self.manual_command(CommandCode::MoveAbsolute, position, speed, LOCAL_PRIORITY)
            .await
    }

    async fn jog(&self, direction: JogDirection, speed: i64) -> CellResult<()> {
        let speed = validation::validate_speed(speed).map_err(|e| CellError::rejected(e.to_string()))?;
        self.manual_command(direction.command(), 0, speed, LOCAL_PRIORITY).await
    }

    /// Build a local-panel packet and write it, refusing unless in manual mode
    async fn manual_command(&self, code: CommandCode, position: i32, speed: u32, priority: u16) -> CellResult<()> {
        let mode = self.current_mode().await;
        if mode != map::MODE_MANUAL {
            return Err(CellError::rejected(format!(
                "{:?} needs manual mode, controller is in auto",
                code
            )));
        }
        let packet = CommandPacket::new(code, CommandSource::LocalUi, priority)
            .with_motion(position, CommandPacket::register_speed(speed as i64, &self.events()));
        self.write_command(packet).await
    }
}
