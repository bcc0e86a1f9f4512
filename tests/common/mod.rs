#![allow(dead_code)]

use hoymiles_bridge::hoymiles::frame;
use hoymiles_bridge::prelude::*;
use std::sync::Arc;

pub struct Factory;

impl Factory {
    pub fn config_yaml(yaml: &str) -> Arc<Config> {
        Arc::new(Config::from_yaml(yaml).expect("factory config must parse"))
    }

    /// One single-phase 800 W source on port 0, feeding L1.
    pub fn config() -> Arc<Config> {
        Self::config_yaml(
            r#"
serial_port: /dev/null
tcp_port: 5502
unit_id: 126
phases: 1
rated_voltage: 230
poll_interval_ms: 200
rtu_timeout_ms: 100
sources:
  - port_number: 0
    name: test-0
    model: HMS-800-2T
    connected_phase: 1
"#,
        )
    }

    /// Two single-phase sources on ports 0 and 1, feeding L1 and L2.
    pub fn two_source_config() -> Arc<Config> {
        Self::config_yaml(
            r#"
serial_port: /dev/null
tcp_port: 5502
unit_id: 126
phases: 3
rated_voltage: 230
poll_interval_ms: 200
rtu_timeout_ms: 100
sources:
  - port_number: 0
    name: test-0
    model: HMS-800-2T
    connected_phase: 1
  - port_number: 1
    name: test-1
    model: HMS-800-2T
    connected_phase: 2
"#,
        )
    }

    /// A 40-register Hoymiles port block with the given electrical values.
    pub fn port_block(
        power_w: u16,
        grid_v: u16,
        freq_raw: u16,
        today_wh: u32,
        lifetime_wh: u32,
        temp_c: i16,
    ) -> Vec<u16> {
        let mut regs = vec![0u16; 40];
        regs[0x01] = u16::from_be_bytes([b'1', b'1']);
        regs[0x02] = u16::from_be_bytes([b'2', b'3']);
        regs[0x03] = u16::from_be_bytes([b'8', b'0']);
        regs[0x04] = u16::from_be_bytes([b'1', b'6']);
        regs[0x05] = u16::from_be_bytes([b'5', b'4']);
        regs[0x08] = 33; // PV voltage
        regs[0x09] = 19; // PV current (A * 2)
        regs[0x0A] = grid_v;
        regs[0x0B] = freq_raw;
        regs[0x0C] = power_w;
        regs[0x0D] = (today_wh >> 16) as u16;
        regs[0x0E] = (today_wh & 0xFFFF) as u16;
        regs[0x0F] = (lifetime_wh >> 16) as u16;
        regs[0x10] = (lifetime_wh & 0xFFFF) as u16;
        regs[0x11] = temp_c as u16;
        regs[0x1E] = 3; // operating
        regs[0x20] = 1; // linked
        regs
    }

    /// The S2 block: 650 W at 230 V / 49.99 Hz, 1234 Wh today,
    /// 12340 Wh lifetime, 42 °C.
    pub fn producing_block() -> Vec<u16> {
        Self::port_block(650, 230, 4999, 1234, 12340, 42)
    }

    /// A framed ReadHoldingRegisters response carrying `regs`.
    pub fn read_response(addr: u8, regs: &[u16]) -> Vec<u8> {
        let mut resp = vec![addr, 0x03, (regs.len() * 2) as u8];
        for reg in regs {
            resp.extend_from_slice(&reg.to_be_bytes());
        }
        let crc = frame::crc16(&resp);
        resp.extend_from_slice(&crc.to_le_bytes());
        resp
    }

    /// A framed exception response.
    pub fn exception_response(addr: u8, fc: u8, code: u8) -> Vec<u8> {
        let mut resp = vec![addr, fc | 0x80, code];
        let crc = frame::crc16(&resp);
        resp.extend_from_slice(&crc.to_le_bytes());
        resp
    }
}
