//! # Frame Codec
//!
//! Builds and parses frames for the four register operations the cell uses
//! (read-holding, read-input, write-single, write-multiple) in both of the
//! fieldbus encapsulations:
//!
//! ```text
//! Serial: [node id][function code][payload....][crc lo][crc hi]
//! TCP:    [transaction id:2][protocol id:2 = 0][length:2][unit id][function code][payload....]
//! ```
//!
//! Parsers never panic and never raise: every malformed input comes back as a
//! tagged [`DecodeError`]. The caller must say which [`Framing`] produced the
//! bytes since the payload offsets differ.
//!
//! ```rust
//! use stepper_cell::protocol::{self, Framing, ModbusRequest};
//!
//! let request = ModbusRequest::read_holding(2, 0x1010, 1);
//! let frame = request.encode(Framing::Rtu);
//! assert_eq!(&frame[..6], &[0x02, 0x03, 0x10, 0x10, 0x00, 0x01]);
//!
//! let reply = protocol::wrap_pdu(Framing::Rtu, 2, &[0x03, 0x02, 0x00, 0x14]);
//! let response = protocol::parse_response(&reply, Framing::Rtu, &request).unwrap();
//! assert_eq!(response.registers(), &[0x0014]);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::checksum;
use crate::error::{CellError, CellResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Field node / unit identifier
pub type SlaveId = u8;

/// Size of the TCP header including the unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest read quantity accepted by fc 3/4
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest write quantity accepted by fc 16
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Function codes spoken on the cell's fieldbus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(ModbusFunction::ReadHoldingRegisters),
            0x04 => Some(ModbusFunction::ReadInputRegisters),
            0x06 => Some(ModbusFunction::WriteSingleRegister),
            0x10 => Some(ModbusFunction::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes produced by the virtual slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ModbusException {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Server Device Failure",
        };
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), text)
    }
}

/// Encapsulation of a frame on the wire
///
/// The TCP variant carries the transaction id to stamp into a request, or
/// the id a response is expected to echo when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Rtu,
    Tcp { transaction_id: u16 },
}

/// Tagged decode failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("byte count mismatch: declared {declared}, found {actual}")]
    ByteCountMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:04X}, got {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("protocol id {0} is not Modbus")]
    ProtocolId(u16),

    #[error("transaction id {actual} does not echo {expected}")]
    TransactionMismatch { expected: u16, actual: u16 },

    #[error("reply from node {actual}, expected node {expected}")]
    UnexpectedNode { expected: u8, actual: u8 },

    #[error("unexpected function code 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    #[error("exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },
}

/// Decoded TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id plus PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(DecodeError::TooShort {
                expected: MBAP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    /// Bytes still to read after the 7-byte header
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

/// One request for a field node
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    /// Values to write; empty for reads
    pub values: Vec<ModbusValue>,
}

impl ModbusRequest {
    pub fn read_holding(slave_id: SlaveId, address: ModbusAddress, quantity: u16) -> Self {
        Self::read(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity)
    }

    pub fn read_input(slave_id: SlaveId, address: ModbusAddress, quantity: u16) -> Self {
        Self::read(slave_id, ModbusFunction::ReadInputRegisters, address, quantity)
    }

    fn read(slave_id: SlaveId, function: ModbusFunction, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            values: Vec::new(),
        }
    }

    pub fn write_single(slave_id: SlaveId, address: ModbusAddress, value: ModbusValue) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            values: vec![value],
        }
    }

    pub fn write_multiple(slave_id: SlaveId, address: ModbusAddress, values: &[ModbusValue]) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            values: values.to_vec(),
        }
    }

    /// Reject quantities a field node would answer with an exception
    pub fn validate(&self) -> CellResult<()> {
        let limit = match self.function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            ModbusFunction::WriteSingleRegister => 1,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
        };
        if self.quantity == 0 || self.quantity > limit {
            return Err(CellError::invalid_data(format!(
                "{} quantity {} outside 1..={}",
                self.function, self.quantity, limit
            )));
        }
        if !self.function.is_read_function() && self.values.len() != self.quantity as usize {
            return Err(CellError::invalid_data(format!(
                "{} carries {} values for quantity {}",
                self.function,
                self.values.len(),
                self.quantity
            )));
        }
        Ok(())
    }

    /// Function code plus payload, without node id or framing
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.values.len() * 2);
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.address.to_be_bytes());
        match self.function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
            }
            ModbusFunction::WriteSingleRegister => {
                let value = self.values.first().copied().unwrap_or(0);
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            ModbusFunction::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push((self.values.len() * 2) as u8);
                pdu.extend_from_slice(&data_utils::registers_to_bytes(&self.values));
            }
        }
        pdu
    }

    /// Complete frame for the given encapsulation
    pub fn encode(&self, framing: Framing) -> Vec<u8> {
        wrap_pdu(framing, self.slave_id, &self.to_pdu())
    }

    /// Decode a request PDU on the serving side
    ///
    /// Unknown function codes come back as `IllegalFunction`, bad quantities
    /// and byte counts as `IllegalDataValue`.
    pub fn from_pdu(slave_id: SlaveId, pdu: &[u8]) -> Result<Self, ModbusException> {
        let code = *pdu.first().ok_or(ModbusException::IllegalFunction)?;
        let function = ModbusFunction::from_u8(code).ok_or(ModbusException::IllegalFunction)?;
        if pdu.len() < 5 {
            return Err(ModbusException::IllegalDataValue);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);

        match function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                if word == 0 || word > MAX_READ_REGISTERS {
                    return Err(ModbusException::IllegalDataValue);
                }
                Ok(Self::read(slave_id, function, address, word))
            }
            ModbusFunction::WriteSingleRegister => Ok(Self::write_single(slave_id, address, word)),
            ModbusFunction::WriteMultipleRegisters => {
                let byte_count = *pdu.get(5).ok_or(ModbusException::IllegalDataValue)? as usize;
                if word == 0
                    || word > MAX_WRITE_REGISTERS
                    || byte_count != word as usize * 2
                    || pdu.len() < 6 + byte_count
                {
                    return Err(ModbusException::IllegalDataValue);
                }
                let values = data_utils::bytes_to_registers(&pdu[6..6 + byte_count]);
                Ok(Self::write_multiple(slave_id, address, &values))
            }
        }
    }
}

/// Body of a successful response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// fc 3/4 register values
    Registers(Vec<ModbusValue>),
    /// fc 6 echoes address and value, fc 16 echoes address and quantity
    Written { address: ModbusAddress, value: u16 },
}

/// Decoded response from a field node
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub body: ResponseBody,
}

impl ModbusResponse {
    /// Response a serving node gives to `request` after executing it
    pub fn for_request(request: &ModbusRequest, registers: Vec<ModbusValue>) -> Self {
        let body = match request.function {
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                ResponseBody::Registers(registers)
            }
            ModbusFunction::WriteSingleRegister => ResponseBody::Written {
                address: request.address,
                value: request.values.first().copied().unwrap_or(0),
            },
            ModbusFunction::WriteMultipleRegisters => ResponseBody::Written {
                address: request.address,
                value: request.quantity,
            },
        };
        Self {
            slave_id: request.slave_id,
            function: request.function,
            body,
        }
    }

    /// Register values; empty for write acknowledgements
    pub fn registers(&self) -> &[ModbusValue] {
        match &self.body {
            ResponseBody::Registers(values) => values,
            ResponseBody::Written { .. } => &[],
        }
    }

    pub fn to_pdu(&self) -> Vec<u8> {
        let mut pdu = vec![self.function.to_u8()];
        match &self.body {
            ResponseBody::Registers(values) => {
                pdu.push((values.len() * 2) as u8);
                pdu.extend_from_slice(&data_utils::registers_to_bytes(values));
            }
            ResponseBody::Written { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        }
        pdu
    }

    pub fn encode(&self, framing: Framing) -> Vec<u8> {
        wrap_pdu(framing, self.slave_id, &self.to_pdu())
    }
}

/// Exception PDU: function code with the high bit set, then the code
pub fn exception_pdu(function_code: u8, exception: ModbusException) -> Vec<u8> {
    vec![function_code | 0x80, exception.to_u8()]
}

/// Wrap a PDU for the wire
pub fn wrap_pdu(framing: Framing, slave_id: SlaveId, pdu: &[u8]) -> Vec<u8> {
    match framing {
        Framing::Rtu => {
            let mut body = Vec::with_capacity(pdu.len() + 1);
            body.push(slave_id);
            body.extend_from_slice(pdu);
            checksum::append(&body)
        }
        Framing::Tcp { transaction_id } => {
            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
            frame.extend_from_slice(&transaction_id.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
            frame.push(slave_id);
            frame.extend_from_slice(pdu);
            frame
        }
    }
}

/// Strip framing and return `(node id, pdu)`
///
/// Serial frames are checksum-verified. TCP frames must carry protocol id 0,
/// a length that fits the buffer, and echo the expected transaction id.
pub fn unwrap_frame(frame: &[u8], framing: Framing) -> Result<(SlaveId, &[u8]), DecodeError> {
    match framing {
        Framing::Rtu => {
            // node + fc + crc
            if frame.len() < 4 {
                return Err(DecodeError::TooShort {
                    expected: 4,
                    actual: frame.len(),
                });
            }
            let body = &frame[..frame.len() - 2];
            let expected = checksum::compute(body);
            let actual = checksum::trailer(frame).unwrap_or_default();
            if expected != actual {
                return Err(DecodeError::ChecksumMismatch { expected, actual });
            }
            Ok((body[0], &body[1..]))
        }
        Framing::Tcp { transaction_id } => {
            if frame.len() < MBAP_HEADER_LEN + 1 {
                return Err(DecodeError::TooShort {
                    expected: MBAP_HEADER_LEN + 1,
                    actual: frame.len(),
                });
            }
            let header = MbapHeader::parse(frame)?;
            if header.protocol_id != 0 {
                return Err(DecodeError::ProtocolId(header.protocol_id));
            }
            if header.transaction_id != transaction_id {
                return Err(DecodeError::TransactionMismatch {
                    expected: transaction_id,
                    actual: header.transaction_id,
                });
            }
            let end = MBAP_HEADER_LEN + header.pdu_len();
            if header.pdu_len() == 0 || frame.len() < end {
                return Err(DecodeError::TooShort {
                    expected: end.max(MBAP_HEADER_LEN + 1),
                    actual: frame.len(),
                });
            }
            Ok((header.unit_id, &frame[MBAP_HEADER_LEN..end]))
        }
    }
}

/// Parse the reply to `request`
pub fn parse_response(
    frame: &[u8],
    framing: Framing,
    request: &ModbusRequest,
) -> Result<ModbusResponse, DecodeError> {
    let (slave_id, pdu) = unwrap_frame(frame, framing)?;
    if slave_id != request.slave_id {
        return Err(DecodeError::UnexpectedNode {
            expected: request.slave_id,
            actual: slave_id,
        });
    }

    let expected_fc = request.function.to_u8();
    let fc = pdu[0];
    if fc == expected_fc | 0x80 {
        let code = *pdu.get(1).ok_or(DecodeError::TooShort {
            expected: 2,
            actual: pdu.len(),
        })?;
        return Err(DecodeError::Exception {
            function: expected_fc,
            code,
        });
    }
    if fc != expected_fc {
        return Err(DecodeError::UnexpectedFunction {
            expected: expected_fc,
            actual: fc,
        });
    }

    let body = if request.function.is_read_function() {
        if pdu.len() < 2 {
            return Err(DecodeError::TooShort {
                expected: 2,
                actual: pdu.len(),
            });
        }
        let declared = pdu[1] as usize;
        let payload = &pdu[2..];
        if payload.len() != declared {
            return Err(DecodeError::ByteCountMismatch {
                declared,
                actual: payload.len(),
            });
        }
        if declared != request.quantity as usize * 2 {
            return Err(DecodeError::ByteCountMismatch {
                declared,
                actual: request.quantity as usize * 2,
            });
        }
        ResponseBody::Registers(data_utils::bytes_to_registers(payload))
    } else {
        if pdu.len() < 5 {
            return Err(DecodeError::TooShort {
                expected: 5,
                actual: pdu.len(),
            });
        }
        ResponseBody::Written {
            address: u16::from_be_bytes([pdu[1], pdu[2]]),
            value: u16::from_be_bytes([pdu[3], pdu[4]]),
        }
    };

    Ok(ModbusResponse {
        slave_id,
        function: request.function,
        body,
    })
}

/// fc 3 request frame
pub fn build_read_holding(framing: Framing, slave_id: SlaveId, address: u16, count: u16) -> Vec<u8> {
    ModbusRequest::read_holding(slave_id, address, count).encode(framing)
}

/// fc 4 request frame
pub fn build_read_input(framing: Framing, slave_id: SlaveId, address: u16, count: u16) -> Vec<u8> {
    ModbusRequest::read_input(slave_id, address, count).encode(framing)
}

/// fc 6 request frame
pub fn build_write_single(framing: Framing, slave_id: SlaveId, address: u16, value: u16) -> Vec<u8> {
    ModbusRequest::write_single(slave_id, address, value).encode(framing)
}

/// fc 16 request frame
pub fn build_write_multiple(framing: Framing, slave_id: SlaveId, address: u16, values: &[u16]) -> Vec<u8> {
    ModbusRequest::write_multiple(slave_id, address, values).encode(framing)
}

/// Register packing helpers
///
/// 32-bit quantities occupy two consecutive registers, high word first.
pub mod data_utils {
    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian); a trailing odd byte is dropped
    pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    pub fn registers_to_u32(hi: u16, lo: u16) -> u32 {
        ((hi as u32) << 16) | lo as u32
    }

    /// Two's-complement split of a signed 32-bit value
    pub fn i32_to_registers(value: i32) -> [u16; 2] {
        u32_to_registers(value as u32)
    }

    pub fn registers_to_i32(hi: u16, lo: u16) -> i32 {
        registers_to_u32(hi, lo) as i32
    }

    /// Signed 16-bit register scaled by 1/10
    pub fn tenths_to_f64(raw: u16) -> f64 {
        raw as i16 as f64 / 10.0
    }

    /// Inverse of [`tenths_to_f64`], saturating at the i16 range
    pub fn f64_to_tenths(value: f64) -> u16 {
        let scaled = (value * 10.0).round();
        scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16 as u16
    }
}
