//! # Stepper Cell Error Handling
//!
//! Every fallible operation in the cell returns a [`CellResult`]. Transport
//! and device layers never abort the process: a failure is handed back to the
//! calling loop, which decides whether to retry on its next cycle, mark a
//! device disconnected, or surface the error text to the presentation tier.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **Timeout**: no bytes arrived within the transaction deadline
//! - **Connection closed**: the link was never opened or was closed underneath us
//! - **I/O**: socket or serial port failures
//!
//! ### Protocol Errors
//! - **Checksum**: serial CRC did not match, response discarded
//! - **Malformed**: short or internally inconsistent response payload
//! - **Exception**: the field node answered with an exception response
//!
//! ### Command Errors
//! - **Rejected**: an operator or local command failed validation
//! - **Invalid data / configuration**: bad values handed in by a caller
//!
//! ```rust
//! use stepper_cell::{CellError, CellResult};
//!
//! fn describe(result: CellResult<Vec<u16>>) -> String {
//!     match result {
//!         Ok(regs) => format!("{} registers", regs.len()),
//!         Err(e) if e.is_recoverable() => format!("retry next cycle: {}", e),
//!         Err(e) => format!("giving up: {}", e),
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::DecodeError;

/// Result type alias for cell operations
pub type CellResult<T> = Result<T, CellError>;

/// Error taxonomy shared by the transport, device, controller and bridge layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CellError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The connection could not be established
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The link is closed; the transaction was never put on the wire
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    /// No bytes were received before the deadline
    ///
    /// Always recoverable. The controller simply tries again on its next
    /// tick; nothing in the transport layer retries on its own.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Serial checksum mismatch, the response was discarded
    #[error("Checksum mismatch: expected={expected:04X}, actual={actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// Short or inconsistent response payload
    ///
    /// Devices that receive this mark themselves disconnected.
    #[error("Malformed response: {message}")]
    Malformed { message: String },

    /// Exception response from a field node
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Invalid data value supplied by a caller
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// A command was refused before anything was written
    #[error("Command rejected: {reason}")]
    Rejected { reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl CellError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn connection_closed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionClosed { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn checksum_mismatch(expected: u16, actual: u16) -> Self {
        Self::ChecksumMismatch { expected, actual }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::Malformed { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        Self::Rejected { reason: reason.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// ```rust
    /// use stepper_cell::CellError;
    ///
    /// assert!(CellError::timeout("read status", 1000).is_recoverable());
    /// assert!(!CellError::rejected("unsupported command").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::ConnectionClosed { .. } => true,
            Self::Timeout { .. } => true,
            Self::ChecksumMismatch { .. } => true,
            Self::Malformed { .. } => true,
            // Acknowledge, Busy
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a link-level issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::ConnectionClosed { .. }
                | Self::Timeout { .. }
        )
    }

    /// Check if the error came from decoding or from the field node itself
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::Malformed { .. } | Self::Exception { .. }
        )
    }
}

impl From<DecodeError> for CellError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::ChecksumMismatch { expected, actual } => {
                Self::checksum_mismatch(expected, actual)
            }
            DecodeError::Exception { function, code } => Self::exception(function, code),
            other => Self::malformed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CellError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::connection_closed(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for CellError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for CellError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

impl From<tokio_serial::Error> for CellError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}
