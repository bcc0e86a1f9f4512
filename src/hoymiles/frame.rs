//! Modbus RTU framing for the DTU link.
//!
//! Frames are `[addr][fc][payload..][crc_lo][crc_hi]` with CRC-16/Modbus
//! over everything before the trailer.

use crate::prelude::*;

pub const READ_HOLDING: u8 = 0x03;
pub const WRITE_COIL: u8 = 0x05;
pub const WRITE_SINGLE: u8 = 0x06;

/// A parsed (non-exception) RTU response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuResponse {
    pub addr: u8,
    pub fc: u8,
    pub payload: Vec<u8>,
}

pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

fn finish(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn build_read_holding(addr: u8, start: u16, count: u16) -> Vec<u8> {
    let mut f = vec![addr, READ_HOLDING];
    f.extend_from_slice(&start.to_be_bytes());
    f.extend_from_slice(&count.to_be_bytes());
    finish(f)
}

pub fn build_write_single(addr: u8, reg: u16, value: u16) -> Vec<u8> {
    let mut f = vec![addr, WRITE_SINGLE];
    f.extend_from_slice(&reg.to_be_bytes());
    f.extend_from_slice(&value.to_be_bytes());
    finish(f)
}

pub fn build_write_coil(addr: u8, coil: u16, on: bool) -> Vec<u8> {
    let mut f = vec![addr, WRITE_COIL];
    f.extend_from_slice(&coil.to_be_bytes());
    f.extend_from_slice(&(if on { 0xFF00u16 } else { 0x0000 }).to_be_bytes());
    finish(f)
}

/// Parse one complete response frame from `buf`.
///
/// Returns `Short` while the buffer does not yet hold a full frame, so a
/// caller accumulating serial input can keep reading until its deadline.
pub fn parse_response(buf: &[u8]) -> Result<RtuResponse, RtuError> {
    if buf.len() < 5 {
        return Err(RtuError::Short);
    }

    let fc = buf[1];
    let frame_len = if fc & 0x80 != 0 {
        5
    } else if fc == READ_HOLDING {
        // addr + fc + byte count + data + crc
        5 + buf[2] as usize
    } else {
        // fixed-length echo (write single / write coil)
        8
    };
    if buf.len() < frame_len {
        return Err(RtuError::Short);
    }

    let frame = &buf[..frame_len];
    let expected = crc16(&frame[..frame_len - 2]);
    let received = u16::from_le_bytes([frame[frame_len - 2], frame[frame_len - 1]]);
    if expected != received {
        return Err(RtuError::Crc);
    }

    if fc & 0x80 != 0 {
        return Err(RtuError::Exception(frame[2]));
    }

    Ok(RtuResponse {
        addr: frame[0],
        fc,
        payload: frame[2..frame_len - 2].to_vec(),
    })
}

/// Registers from a ReadHoldingRegisters response payload
/// (`[byte_count][hi][lo]...`).
pub fn payload_registers(payload: &[u8]) -> Result<Vec<u16>, RtuError> {
    if payload.is_empty() {
        return Err(RtuError::Short);
    }
    let byte_count = payload[0] as usize;
    if byte_count % 2 != 0 || payload.len() < 1 + byte_count {
        return Err(RtuError::Short);
    }
    Ok(payload[1..1 + byte_count]
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}
