//! Per-inverter runtime state.

use crate::hoymiles::port_data::PortData;
use crate::prelude::*;
use crate::sunspec::model::{self, OperatingState};
use std::time::Instant;

/// Counters kept per source, exposed through snapshots and the shutdown
/// summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollStats {
    pub poll_success: u64,
    pub poll_fail: u64,
    pub poll_timeout: u64,
    pub crc_error: u64,
}

/// One physical inverter behind a DTU port.
///
/// `raw_regs` holds the source's last telemetry re-encoded as a Model
/// 101-shaped payload with the served scale factors, so the aggregator
/// works on uniform blocks regardless of where the data came from.
pub struct Source {
    pub port_number: u8,
    pub phases: u8,
    pub connected_phase: u8,
    pub rated_power_w: u16,
    pub mppt_inputs: u8,
    pub name: String,
    pub model: String,
    pub configured_serial: Option<String>,

    pub dtu_serial: Option<String>,
    pub raw_regs: [u16; model::MODEL_INV_SIZE as usize],
    pub decoded: PortData,
    pub stats: PollStats,
    pub last_poll: Option<Instant>,
    pub data_valid: bool,
    pub initial_metadata_read: bool,
}

impl Source {
    pub fn from_config(cfg: &config::SourceConfig) -> Self {
        Self {
            port_number: cfg.port_number(),
            phases: cfg.phases(),
            connected_phase: if cfg.phases() == 1 {
                cfg.connected_phase()
            } else {
                0 // feeds all phases
            },
            rated_power_w: cfg.rated_power_w(),
            mppt_inputs: cfg.mppt_inputs(),
            name: cfg.name().to_string(),
            model: cfg.model().to_string(),
            configured_serial: cfg.serial().map(str::to_string),
            dtu_serial: None,
            raw_regs: [model::NOT_IMPL_U16; model::MODEL_INV_SIZE as usize],
            decoded: PortData::default(),
            stats: PollStats::default(),
            last_poll: None,
            data_valid: false,
            initial_metadata_read: false,
        }
    }

    /// The serial presented downstream: configured wins, otherwise the
    /// one discovered from the DTU.
    pub fn serial(&self) -> Option<&str> {
        self.configured_serial
            .as_deref()
            .or(self.dtu_serial.as_deref())
    }

    /// Apply a successfully parsed port block.
    pub fn apply_block(&mut self, data: PortData, now: Instant) {
        if !self.initial_metadata_read {
            if let Some(sn) = &data.serial {
                info!(
                    "source '{}' (port {}) serial: {}",
                    self.name, self.port_number, sn
                );
                self.dtu_serial = Some(sn.clone());
            }
            self.initial_metadata_read = true;
        }

        self.decoded = data;
        self.encode_block();
        self.data_valid = true;
        self.last_poll = Some(now);
        self.stats.poll_success += 1;
    }

    pub fn record_failure(&mut self, err: &RtuError) {
        match err {
            RtuError::Timeout => self.stats.poll_timeout += 1,
            RtuError::Crc => {
                self.stats.crc_error += 1;
                self.stats.poll_fail += 1;
            }
            _ => self.stats.poll_fail += 1,
        }
    }

    /// Seconds since the last good poll, if any.
    pub fn age_secs(&self, now: Instant) -> Option<u64> {
        self.last_poll.map(|t| now.duration_since(t).as_secs())
    }

    /// Re-encode the decoded values as a SunSpec inverter payload.
    ///
    /// Quantities the DTU does not report (VA, VAr, PF) carry
    /// not-implemented sentinels so aggregation skips them. Three-phase
    /// units report one grid voltage and no phase split, so the voltage
    /// is replicated and the current divided into equal thirds.
    fn encode_block(&mut self) {
        let d = &self.decoded;
        let blk = &mut self.raw_regs;
        for r in blk.iter_mut() {
            *r = model::NOT_IMPL_U16;
        }

        blk[model::INV_A_SF] = model::A_SF as u16;
        blk[model::INV_V_SF] = model::V_SF as u16;
        blk[model::INV_W_SF] = model::W_SF as u16;
        blk[model::INV_HZ_SF] = model::HZ_SF as u16;
        blk[model::INV_VA_SF] = model::VA_SF as u16;
        blk[model::INV_VAR_SF] = model::VAR_SF as u16;
        blk[model::INV_PF_SF] = model::PF_SF as u16;
        blk[model::INV_WH_SF] = model::WH_SF as u16;
        blk[model::INV_DCA_SF] = model::DCA_SF as u16;
        blk[model::INV_DCV_SF] = model::DCV_SF as u16;
        blk[model::INV_DCW_SF] = model::DCW_SF as u16;
        blk[model::INV_TMP_SF] = model::TMP_SF as u16;

        blk[model::INV_W] = d.power_w as i16 as u16;
        blk[model::INV_A] = (d.current_a * 100.0) as u16;
        blk[model::INV_HZ] = (d.frequency_hz * 100.0) as u16;

        if self.phases == 3 {
            let third = (d.current_a / 3.0 * 100.0) as u16;
            for off in [model::INV_APH_A, model::INV_APH_B, model::INV_APH_C] {
                blk[off] = third;
            }
            let v = (d.voltage_v * 10.0) as u16;
            for off in [model::INV_PHV_A, model::INV_PHV_B, model::INV_PHV_C] {
                blk[off] = v;
            }
        } else {
            blk[model::INV_APH_A] = (d.current_a * 100.0) as u16;
            blk[model::INV_PHV_A] = (d.voltage_v * 10.0) as u16;
        }

        blk[model::INV_VA] = model::NOT_IMPL_I16;
        blk[model::INV_VAR] = model::NOT_IMPL_I16;
        blk[model::INV_PF] = model::NOT_IMPL_I16;

        blk[model::INV_WH] = (d.lifetime_energy_wh >> 16) as u16;
        blk[model::INV_WH + 1] = (d.lifetime_energy_wh & 0xFFFF) as u16;

        blk[model::INV_DCA] = (d.pv_current_a * 100.0) as u16;
        blk[model::INV_DCV] = (d.pv_voltage_v * 10.0) as u16;
        blk[model::INV_DCW] = d.pv_power_w as i16 as u16;

        blk[model::INV_TMP_CAB] = (d.temperature_c * 10.0) as i16 as u16;
        blk[model::INV_TMP_SNK] = model::NOT_IMPL_I16;
        blk[model::INV_TMP_TRNS] = model::NOT_IMPL_I16;
        blk[model::INV_TMP_OT] = model::NOT_IMPL_I16;

        blk[model::INV_ST] = if d.producing {
            OperatingState::Mppt.into()
        } else {
            OperatingState::Sleeping.into()
        };
    }
}
