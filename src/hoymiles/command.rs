//! Translation of SunSpec immediate-control writes into DTU register
//! sequences.
//!
//! Per-port control registers on the DTU:
//! - `0xC006 + port*6`: ON/OFF coil
//! - `0xC007 + port*6`: output limit in whole percent

use super::frame;
use super::port_data::{CTRL_STRIDE, LIMIT_BASE, ONOFF_BASE};

/// Hoymiles rejects limits below 2%.
const MIN_LIMIT_PCT: u16 = 2;
const MAX_LIMIT_PCT: u16 = 100;

/// Settle time after each write; the DTU forwards commands over RF and
/// chokes on back-to-back frames.
pub const SETTLE_MS: u64 = 100;

/// One fire-and-forget frame for the RS-485 bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusWrite {
    pub frame: Vec<u8>,
    pub settle_ms: u64,
}

impl BusWrite {
    fn new(frame: Vec<u8>) -> Self {
        Self {
            frame,
            settle_ms: SETTLE_MS,
        }
    }
}

pub fn limit_register(port: u8) -> u16 {
    LIMIT_BASE + port as u16 * CTRL_STRIDE
}

pub fn onoff_register(port: u8) -> u16 {
    ONOFF_BASE + port as u16 * CTRL_STRIDE
}

/// Build the write sequence for a Model-123 power-limit command.
///
/// `pct_raw` is the SunSpec WMaxLimPct register value (tenths of a
/// percent). When enabled, each port gets its limit written followed by
/// an ON coil; when disabled, each port's limit is restored to 100%.
pub fn power_limit_writes(
    dtu_address: u8,
    ports: &[u8],
    pct_raw: u16,
    enabled: bool,
) -> Vec<BusWrite> {
    let mut writes = Vec::with_capacity(ports.len() * 2);

    for &port in ports {
        if enabled {
            let hm_pct = (pct_raw / 10).clamp(MIN_LIMIT_PCT, MAX_LIMIT_PCT);
            writes.push(BusWrite::new(frame::build_write_single(
                dtu_address,
                limit_register(port),
                hm_pct,
            )));
            writes.push(BusWrite::new(frame::build_write_coil(
                dtu_address,
                onoff_register(port),
                true,
            )));
        } else {
            writes.push(BusWrite::new(frame::build_write_single(
                dtu_address,
                limit_register(port),
                MAX_LIMIT_PCT,
            )));
        }
    }

    writes
}
