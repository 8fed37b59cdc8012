//! CRC-16 for serial frames.
//!
//! Reflected polynomial 0xA001, initial value 0xFFFF, processed LSB-first.
//! The checksum travels little-endian at the tail of every serial frame.
//!
//! ```rust
//! use stepper_cell::checksum;
//!
//! let frame = checksum::append(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
//! assert_eq!(&frame[6..], &[0xC4, 0x0B]);
//! assert!(checksum::verify(&frame));
//! ```

use crc::{Crc, CRC_16_MODBUS};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the checksum over `data`
pub fn compute(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Copy `data` and append its checksum, low byte first
pub fn append(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&compute(data).to_le_bytes());
    frame
}

/// Checksum carried in the last two bytes of `frame`, if there are any
pub fn trailer(frame: &[u8]) -> Option<u16> {
    let len = frame.len();
    if len < 2 {
        return None;
    }
    Some(u16::from_le_bytes([frame[len - 2], frame[len - 1]]))
}

/// Recompute over all but the last two bytes and compare with the trailer
pub fn verify(frame: &[u8]) -> bool {
    match trailer(frame) {
        Some(received) => compute(&frame[..frame.len() - 2]) == received,
        None => false,
    }
}
