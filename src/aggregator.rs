//! Fusion of per-source telemetry into the served inverter payload.
//!
//! Runs after every successful poll. Reads each source's SunSpec-shaped
//! block with its embedded scale factors, accumulates per-phase and
//! total quantities, and rewrites the value fields of the inverter
//! payload. Scale factors and model headers are never touched.

use crate::prelude::*;
use crate::sunspec::image::RegisterImage;
use crate::sunspec::model::{self, OperatingState};

/// The scalar snapshot produced alongside the register rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct AggregateReading {
    pub power_w: f32,
    pub current_a: f32,
    pub voltage_v: f32,
    pub frequency_hz: f32,
    pub energy_kwh: f32,
    pub phase_power_w: [f32; 3],
    pub producing: bool,
    pub valid_sources: usize,
}

fn apply_i16(raw: u16, sf: i16) -> Option<f32> {
    if raw == model::NOT_IMPL_I16 {
        return None;
    }
    Some(raw as i16 as f32 * 10f32.powi(sf as i32))
}

fn apply_u16(raw: u16, sf: i16) -> Option<f32> {
    if raw == model::NOT_IMPL_U16 {
        return None;
    }
    Some(raw as f32 * 10f32.powi(sf as i32))
}

/// Line-to-line magnitude from two line-to-neutral magnitudes 120° apart:
/// |Vi - Vj·e^(j120°)| = sqrt(Vi² + Vj² + Vi·Vj).
fn line_to_line(vi: f32, vj: f32) -> f32 {
    (vi * vi + vj * vj + vi * vj).sqrt()
}

pub fn aggregate(sources: &[Source], agg_phases: u8, image: &mut RegisterImage) -> AggregateReading {
    let mut phase_power = [0f32; 3];
    let mut phase_current = [0f32; 3];
    let mut phase_voltage_sum = [0f32; 3];
    let mut phase_voltage_count = [0u32; 3];

    let mut total_power = 0f32;
    let mut total_current = 0f32;
    let mut sum_freq = 0f32;
    let mut total_va = 0f32;
    let mut total_var = 0f32;
    let mut total_energy_wh = 0u32;
    let mut max_temp: Option<f32> = None;
    let mut total_dc_power = 0f32;
    let mut valid_count = 0usize;
    let mut any_producing = false;

    for s in sources.iter() {
        if !s.data_valid {
            continue;
        }
        valid_count += 1;

        let r = &s.raw_regs;
        let a_sf = r[model::INV_A_SF] as i16;
        let v_sf = r[model::INV_V_SF] as i16;
        let w_sf = r[model::INV_W_SF] as i16;
        let hz_sf = r[model::INV_HZ_SF] as i16;
        let va_sf = r[model::INV_VA_SF] as i16;
        let var_sf = r[model::INV_VAR_SF] as i16;
        let wh_sf = r[model::INV_WH_SF] as i16;
        let dcw_sf = r[model::INV_DCW_SF] as i16;
        let tmp_sf = r[model::INV_TMP_SF] as i16;

        let power = apply_i16(r[model::INV_W], w_sf);
        if let Some(pw) = power {
            total_power += pw;
            if pw > 0.0 {
                any_producing = true;
            }
        }

        let current = apply_u16(r[model::INV_A], a_sf);
        if let Some(cur) = current {
            total_current += cur;
        }

        if s.phases == 3 {
            let i_abc = [
                apply_u16(r[model::INV_APH_A], a_sf),
                apply_u16(r[model::INV_APH_B], a_sf),
                apply_u16(r[model::INV_APH_C], a_sf),
            ];
            for (p, i) in i_abc.iter().enumerate() {
                if let Some(i) = i {
                    phase_current[p] += i;
                }
            }

            let v_abc = [
                apply_u16(r[model::INV_PHV_A], v_sf),
                apply_u16(r[model::INV_PHV_B], v_sf),
                apply_u16(r[model::INV_PHV_C], v_sf),
            ];
            for (p, v) in v_abc.iter().enumerate() {
                if let Some(v) = v {
                    phase_voltage_sum[p] += v;
                    phase_voltage_count[p] += 1;
                }
            }

            // Split power across phases by per-phase current, falling
            // back to equal thirds when no phase currents are reported.
            if let Some(pw) = power {
                let total_i: f32 = i_abc.iter().flatten().sum();
                if total_i > 0.0 {
                    for (p, i) in i_abc.iter().enumerate() {
                        phase_power[p] += pw * i.unwrap_or(0.0) / total_i;
                    }
                } else {
                    for pp in phase_power.iter_mut() {
                        *pp += pw / 3.0;
                    }
                }
            }
        } else {
            let ph = match s.connected_phase {
                1..=3 => s.connected_phase as usize - 1,
                _ => 0,
            };

            // AphA carries the source's total current; fall back to the
            // total-current register when it is absent.
            let i_a = apply_u16(r[model::INV_APH_A], a_sf).or(current);
            if let Some(i) = i_a {
                phase_current[ph] += i;
            }

            if let Some(v) = apply_u16(r[model::INV_PHV_A], v_sf) {
                phase_voltage_sum[ph] += v;
                phase_voltage_count[ph] += 1;
            }

            if let Some(pw) = power {
                phase_power[ph] += pw;
            }
        }

        if let Some(va) = apply_i16(r[model::INV_VA], va_sf) {
            total_va += va;
        }
        if let Some(var) = apply_i16(r[model::INV_VAR], var_sf) {
            total_var += var;
        }

        if let Some(freq) = apply_u16(r[model::INV_HZ], hz_sf) {
            sum_freq += freq;
        }

        let e_raw = ((r[model::INV_WH] as u32) << 16) | r[model::INV_WH + 1] as u32;
        let e_wh = (e_raw as f32 * 10f32.powi(wh_sf as i32)) as u32;
        total_energy_wh = total_energy_wh.wrapping_add(e_wh);

        if let Some(temp) = apply_i16(r[model::INV_TMP_CAB], tmp_sf) {
            max_temp = Some(match max_temp {
                Some(t) if t >= temp => t,
                _ => temp,
            });
        }

        if let Some(dcp) = apply_i16(r[model::INV_DCW], dcw_sf) {
            total_dc_power += dcp;
        }
    }

    let inv = image.inverter_payload_mut();

    if valid_count == 0 {
        inv[model::INV_ST] = OperatingState::Sleeping.into();
        warn!("aggregation: no valid sources");
        return AggregateReading::default();
    }

    let mut avg_v = [0f32; 3];
    for p in 0..3 {
        if phase_voltage_count[p] > 0 {
            avg_v[p] = phase_voltage_sum[p] / phase_voltage_count[p] as f32;
        }
    }
    let mean_freq = sum_freq / valid_count as f32;

    inv[model::INV_W] = total_power as i16 as u16;

    inv[model::INV_A] = (total_current * 100.0) as u16;
    inv[model::INV_APH_A] = (phase_current[0] * 100.0) as u16;
    inv[model::INV_APH_B] = (phase_current[1] * 100.0) as u16;
    inv[model::INV_APH_C] = (phase_current[2] * 100.0) as u16;

    inv[model::INV_PHV_A] = (avg_v[0] * 10.0) as u16;
    inv[model::INV_PHV_B] = (avg_v[1] * 10.0) as u16;
    inv[model::INV_PHV_C] = (avg_v[2] * 10.0) as u16;

    if agg_phases == 3 {
        inv[model::INV_PPV_AB] = (line_to_line(avg_v[0], avg_v[1]) * 10.0) as u16;
        inv[model::INV_PPV_BC] = (line_to_line(avg_v[1], avg_v[2]) * 10.0) as u16;
        inv[model::INV_PPV_CA] = (line_to_line(avg_v[2], avg_v[0]) * 10.0) as u16;
    }

    inv[model::INV_HZ] = (mean_freq * 100.0) as u16;

    inv[model::INV_VA] = total_va as i16 as u16;
    inv[model::INV_VAR] = total_var as i16 as u16;

    if total_va > 0.0 {
        let pf = (total_power / total_va).min(1.0);
        inv[model::INV_PF] = (pf * 100.0) as i16 as u16;
    }

    inv[model::INV_WH] = (total_energy_wh >> 16) as u16;
    inv[model::INV_WH + 1] = (total_energy_wh & 0xFFFF) as u16;

    if let Some(t) = max_temp {
        inv[model::INV_TMP_CAB] = (t * 10.0) as i16 as u16;
    }

    if total_dc_power > 0.0 {
        inv[model::INV_DCW] = total_dc_power as i16 as u16;
    }

    inv[model::INV_ST] = if any_producing {
        OperatingState::Mppt.into()
    } else {
        OperatingState::Sleeping.into()
    };

    info!(
        "AGG: P={:.0}W (L1:{:.0} L2:{:.0} L3:{:.0}) I={:.2}A V={:.1}/{:.1}/{:.1}V f={:.2}Hz E={:.1}kWh [{}/{} {}]",
        total_power,
        phase_power[0],
        phase_power[1],
        phase_power[2],
        total_current,
        avg_v[0],
        avg_v[1],
        avg_v[2],
        mean_freq,
        total_energy_wh as f32 / 1000.0,
        valid_count,
        sources.len(),
        if any_producing { "MPPT" } else { "Sleep" }
    );

    AggregateReading {
        power_w: total_power,
        current_a: total_current,
        voltage_v: avg_v[0],
        frequency_hz: mean_freq,
        energy_kwh: total_energy_wh as f32 / 1000.0,
        phase_power_w: phase_power,
        producing: any_producing,
        valid_sources: valid_count,
    }
}
