/// Utility functions shared by the transport, device and bridge layers
///
/// Operation timing, range validation for operator-supplied values, and
/// display helpers.

use std::time::{Duration, Instant};
use log::debug;
use crate::error::{CellError, CellResult};

/// Timer for measuring transaction round trips
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {}", self.operation_name, format::format_duration(duration));
        duration
    }
}

/// Range checks for values typed in by an operator
pub mod validation {
    use super::*;

    /// Largest position magnitude accepted for an absolute move
    pub const MAX_POSITION: i64 = 2_000_000_000;

    /// Accepted motion speed range
    pub const MIN_SPEED: i64 = 1;
    pub const MAX_SPEED: i64 = 200_000;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> CellResult<()> {
        if slave_id == 0 || slave_id > 247 {
            return Err(CellError::invalid_data(
                format!("Invalid slave ID: {} (must be 1-247)", slave_id)
            ));
        }
        Ok(())
    }

    pub fn validate_position(position: i64) -> CellResult<i32> {
        if position.abs() > MAX_POSITION {
            return Err(CellError::invalid_data(
                format!("Position {} out of range (|pos| <= {})", position, MAX_POSITION)
            ));
        }
        Ok(position as i32)
    }

    pub fn validate_speed(speed: i64) -> CellResult<u32> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(CellError::invalid_data(
                format!("Speed {} out of range ({}-{})", speed, MIN_SPEED, MAX_SPEED)
            ));
        }
        Ok(speed as u32)
    }

    /// Counter target as written into a single register
    pub fn validate_target(target: i64) -> CellResult<u16> {
        u16::try_from(target).map_err(|_| {
            CellError::invalid_data(format!("Target {} out of range (0-65535)", target))
        })
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers.iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else {
            format!("{:.2}s", duration.as_secs_f64())
        }
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_id(1).is_ok());
        assert!(validation::validate_slave_id(0).is_err());
        assert!(validation::validate_slave_id(248).is_err());

        assert_eq!(validation::validate_position(-2_000_000_000).unwrap(), -2_000_000_000);
        assert!(validation::validate_position(2_000_000_001).is_err());

        assert_eq!(validation::validate_speed(8000).unwrap(), 8000);
        assert!(validation::validate_speed(0).is_err());
        assert!(validation::validate_speed(200_001).is_err());

        assert_eq!(validation::validate_target(65535).unwrap(), 65535);
        assert!(validation::validate_target(-1).is_err());
        assert!(validation::validate_target(65536).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x01, 0x03, 0x10, 0xFF]), "01 03 10 FF");
        assert_eq!(format::registers_to_hex(&[0x1234, 0x5678]), "1234 5678");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(20)), "20ms");
    }
}
