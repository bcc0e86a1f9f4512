//! The served register image.
//!
//! A fixed array of 178 16-bit registers at logical base 40000. Built
//! once at startup; afterwards only value fields inside the inverter
//! payload are rewritten by aggregation, and only the Model 123 payload
//! accepts writes from TCP clients.

use super::model::{self, DeviceIdentity, Model};
use crate::prelude::*;

/// Logical Modbus address of image index 0.
pub const BASE_ADDR: u16 = 40000;

pub const OFF_SUNS: usize = 0;
pub const OFF_MODEL1: usize = 2;
pub const OFF_INV: usize = 70;
pub const OFF_M120: usize = 122;
pub const OFF_M123: usize = 150;
pub const OFF_END: usize = 176;
pub const TOTAL_REGS: usize = 178;

/// First and one-past-last image offsets writable over TCP (the Model
/// 123 payload).
pub const WRITABLE_START: usize = OFF_M123 + 2;
pub const WRITABLE_END: usize = OFF_END;

pub struct RegisterImage {
    regs: [u16; TOTAL_REGS],
}

/// Outcome of an accepted write: the resulting control words and whether
/// the write touched them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEffect {
    pub limit_touched: bool,
    pub limit_pct_raw: u16,
    pub limit_enabled: bool,
}

impl RegisterImage {
    pub fn new() -> Self {
        Self {
            regs: [model::NOT_IMPL_U16; TOTAL_REGS],
        }
    }

    /// Lay down the signature and every model header + startup payload.
    pub fn build_static(&mut self, identity: &DeviceIdentity) {
        self.regs[OFF_SUNS] = 0x5375; // "Su"
        self.regs[OFF_SUNS + 1] = 0x6e53; // "nS"

        let mut off = OFF_MODEL1;
        for m in Model::CHAIN {
            self.regs[off] = m.id(identity);
            self.regs[off + 1] = m.len();
            let len = m.len() as usize;
            m.encode_payload(&mut self.regs[off + 2..off + 2 + len], identity);
            off += 2 + len;
        }
        debug_assert_eq!(off, TOTAL_REGS);

        debug!(
            "register image built: {} registers, inverter model {}",
            TOTAL_REGS,
            Model::Inverter.id(identity)
        );
    }

    pub fn get(&self, off: usize) -> u16 {
        self.regs[off]
    }

    /// The 50-register inverter payload, for the aggregator.
    pub fn inverter_payload_mut(&mut self) -> &mut [u16] {
        &mut self.regs[OFF_INV + 2..OFF_INV + 2 + model::MODEL_INV_SIZE as usize]
    }

    pub fn inverter_payload(&self) -> &[u16] {
        &self.regs[OFF_INV + 2..OFF_INV + 2 + model::MODEL_INV_SIZE as usize]
    }

    /// Read `count` registers starting at logical address `start`.
    pub fn read_range(&self, start: u16, count: u16) -> Result<&[u16], ModbusFault> {
        if start < BASE_ADDR {
            return Err(ModbusFault::IllegalAddress);
        }
        let off = (start - BASE_ADDR) as usize;
        if off + count as usize > TOTAL_REGS {
            return Err(ModbusFault::IllegalAddress);
        }
        Ok(&self.regs[off..off + count as usize])
    }

    /// Write registers starting at logical address `start`. Only the
    /// Model 123 payload accepts writes; anything else is an illegal
    /// address.
    pub fn write_range(&mut self, start: u16, values: &[u16]) -> Result<WriteEffect, ModbusFault> {
        if start < BASE_ADDR {
            return Err(ModbusFault::IllegalAddress);
        }
        let off = (start - BASE_ADDR) as usize;
        if off < WRITABLE_START || off + values.len() > WRITABLE_END {
            return Err(ModbusFault::IllegalAddress);
        }

        self.regs[off..off + values.len()].copy_from_slice(values);

        let pct_off = OFF_M123 + 2 + model::CTL_WMAX_LIM_PCT;
        let ena_off = OFF_M123 + 2 + model::CTL_WMAX_LIM_ENA;
        let range = off..off + values.len();
        let (pct, enabled) = self.power_limit();
        Ok(WriteEffect {
            limit_touched: range.contains(&pct_off) || range.contains(&ena_off),
            limit_pct_raw: pct,
            limit_enabled: enabled,
        })
    }

    /// Current WMaxLimPct (tenths of a percent) and WMaxLim_Ena.
    pub fn power_limit(&self) -> (u16, bool) {
        let pct = self.regs[OFF_M123 + 2 + model::CTL_WMAX_LIM_PCT];
        let ena = self.regs[OFF_M123 + 2 + model::CTL_WMAX_LIM_ENA];
        (pct, ena == 1)
    }
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new()
    }
}
