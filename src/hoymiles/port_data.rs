//! Decode of one DTU port data block.
//!
//! The DTU-Pro exposes each inverter port as 40 holding registers at
//! `0x1000 + port * 0x28`. All values are unsigned 16-bit big-endian
//! unless noted; the two production counters are 32-bit across two
//! registers, high word first.

use crate::prelude::*;

pub const DATA_BASE: u16 = 0x1000;
pub const PORT_STRIDE: u16 = 0x28;
pub const PORT_REGS: u16 = 0x28;

// Per-port control registers
pub const ONOFF_BASE: u16 = 0xC006;
pub const LIMIT_BASE: u16 = 0xC007;
pub const CTRL_STRIDE: u16 = 6;

// Register offsets within a port block
const SN_START: usize = 0x01; // 6 regs = 12 ASCII chars
const PV_VOLTAGE: usize = 0x08;
const PV_CURRENT: usize = 0x09; // A * 2
const GRID_VOLTAGE: usize = 0x0A;
const GRID_FREQ: usize = 0x0B; // Hz * 100
const PV_POWER: usize = 0x0C;
const TODAY_PROD: usize = 0x0D; // Wh, 32-bit
const TOTAL_PROD: usize = 0x0F; // Wh, 32-bit
const TEMPERATURE: usize = 0x11; // °C, signed
const OPERATING_STATUS: usize = 0x1E;
const ALARM_CODE: usize = 0x1F;
const LINK_STATUS: usize = 0x20;

/// Minimum registers needed to cover every field we decode.
const MIN_REGS: usize = 34;

/// One port block decoded into real-world units.
///
/// AC output power is taken as the reported PV power: these are
/// microinverters and the DTU does not report the AC side separately, so
/// conversion losses are intentionally ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortData {
    pub serial: Option<String>,
    pub pv_voltage_v: f32,
    pub pv_current_a: f32,
    pub pv_power_w: f32,
    pub power_w: f32,
    pub current_a: f32,
    pub voltage_v: f32,
    pub frequency_hz: f32,
    pub today_energy_wh: u32,
    pub lifetime_energy_wh: u32,
    pub temperature_c: f32,
    pub operating_status: u16,
    pub alarm_code: u16,
    pub link_status: u8,
    pub producing: bool,
}

impl PortData {
    pub fn parse(regs: &[u16]) -> Result<Self> {
        if regs.len() < MIN_REGS {
            bail!(
                "port block too short: {} registers (need {})",
                regs.len(),
                MIN_REGS
            );
        }

        let voltage_v = regs[GRID_VOLTAGE] as f32;
        let power_w = regs[PV_POWER] as f32;
        let current_a = if voltage_v > 0.0 {
            power_w / voltage_v
        } else {
            0.0
        };

        Ok(Self {
            serial: decode_serial(&regs[SN_START..SN_START + 6]),
            pv_voltage_v: regs[PV_VOLTAGE] as f32,
            pv_current_a: regs[PV_CURRENT] as f32 / 2.0,
            pv_power_w: power_w,
            power_w,
            current_a,
            voltage_v,
            frequency_hz: regs[GRID_FREQ] as f32 / 100.0,
            today_energy_wh: acc32(regs, TODAY_PROD),
            lifetime_energy_wh: acc32(regs, TOTAL_PROD),
            temperature_c: regs[TEMPERATURE] as i16 as f32,
            operating_status: regs[OPERATING_STATUS],
            alarm_code: regs[ALARM_CODE],
            link_status: (regs[LINK_STATUS] & 0xFF) as u8,
            producing: power_w > 0.0,
        })
    }
}

fn acc32(regs: &[u16], off: usize) -> u32 {
    ((regs[off] as u32) << 16) | regs[off + 1] as u32
}

/// Serial number: 6 registers holding 12 ASCII characters, trailing
/// NULs and spaces trimmed. `None` if the field is entirely empty.
fn decode_serial(regs: &[u16]) -> Option<String> {
    let mut bytes = Vec::with_capacity(12);
    for reg in regs {
        bytes.push((reg >> 8) as u8);
        bytes.push((reg & 0xFF) as u8);
    }
    while matches!(bytes.last(), Some(0) | Some(b' ')) {
        bytes.pop();
    }
    if bytes.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<u16> {
        let mut regs = vec![0u16; 40];
        regs[SN_START] = u16::from_be_bytes([b'1', b'1']);
        regs[SN_START + 1] = u16::from_be_bytes([b'2', b'3']);
        regs[SN_START + 2] = u16::from_be_bytes([b'8', b'0']);
        regs[SN_START + 3] = u16::from_be_bytes([b'1', b'6']);
        regs[SN_START + 4] = u16::from_be_bytes([b'5', b'4']);
        regs[SN_START + 5] = 0; // padded
        regs[PV_VOLTAGE] = 33;
        regs[PV_CURRENT] = 19; // 9.5 A
        regs[GRID_VOLTAGE] = 230;
        regs[GRID_FREQ] = 4999;
        regs[PV_POWER] = 650;
        regs[TODAY_PROD] = 0;
        regs[TODAY_PROD + 1] = 1234;
        regs[TOTAL_PROD] = 0x0001;
        regs[TOTAL_PROD + 1] = 0x0000; // 65536 Wh
        regs[TEMPERATURE] = 42;
        regs[OPERATING_STATUS] = 3;
        regs[ALARM_CODE] = 0;
        regs[LINK_STATUS] = 0x0101;
        regs
    }

    #[test]
    fn decodes_scaled_fields() {
        let d = PortData::parse(&block()).unwrap();
        assert_eq!(d.serial.as_deref(), Some("1123801654"));
        assert_eq!(d.pv_current_a, 9.5);
        assert_eq!(d.frequency_hz, 49.99);
        assert_eq!(d.power_w, 650.0);
        assert_eq!(d.today_energy_wh, 1234);
        assert_eq!(d.lifetime_energy_wh, 65536);
        assert_eq!(d.temperature_c, 42.0);
        assert_eq!(d.link_status, 1);
        assert!(d.producing);
        assert!((d.current_a - 650.0 / 230.0).abs() < 1e-4);
    }

    #[test]
    fn negative_temperature() {
        let mut regs = block();
        regs[TEMPERATURE] = (-7i16) as u16;
        assert_eq!(PortData::parse(&regs).unwrap().temperature_c, -7.0);
    }

    #[test]
    fn zero_voltage_means_zero_current() {
        let mut regs = block();
        regs[GRID_VOLTAGE] = 0;
        let d = PortData::parse(&regs).unwrap();
        assert_eq!(d.current_a, 0.0);
    }

    #[test]
    fn short_block_is_rejected() {
        assert!(PortData::parse(&vec![0u16; 33]).is_err());
    }

    #[test]
    fn empty_serial_is_none() {
        let mut regs = block();
        for r in &mut regs[SN_START..SN_START + 6] {
            *r = 0;
        }
        assert_eq!(PortData::parse(&regs).unwrap().serial, None);
    }
}
