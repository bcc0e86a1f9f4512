//! SunSpec model blocks.
//!
//! Every model is an `{id, length, payload}` envelope; the chain starts
//! with the "SunS" signature and ends with id `0xFFFF`. Numeric fields
//! carry signed scale factors; `0xFFFF` (uint) and `0x8000` (int) mean
//! "not implemented".

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const NOT_IMPL_U16: u16 = 0xFFFF;
pub const NOT_IMPL_I16: u16 = 0x8000;

pub const MODEL_1_SIZE: u16 = 66; // Common
pub const MODEL_INV_SIZE: u16 = 50; // Single- or three-phase inverter (int)
pub const MODEL_120_SIZE: u16 = 26; // Nameplate ratings
pub const MODEL_123_SIZE: u16 = 24; // Immediate controls

// Offsets within the Model 101/103 payload
pub const INV_A: usize = 0;
pub const INV_APH_A: usize = 1;
pub const INV_APH_B: usize = 2;
pub const INV_APH_C: usize = 3;
pub const INV_A_SF: usize = 4;
pub const INV_PPV_AB: usize = 5;
pub const INV_PPV_BC: usize = 6;
pub const INV_PPV_CA: usize = 7;
pub const INV_PHV_A: usize = 8;
pub const INV_PHV_B: usize = 9;
pub const INV_PHV_C: usize = 10;
pub const INV_V_SF: usize = 11;
pub const INV_W: usize = 12;
pub const INV_W_SF: usize = 13;
pub const INV_HZ: usize = 14;
pub const INV_HZ_SF: usize = 15;
pub const INV_VA: usize = 16;
pub const INV_VA_SF: usize = 17;
pub const INV_VAR: usize = 18;
pub const INV_VAR_SF: usize = 19;
pub const INV_PF: usize = 20;
pub const INV_PF_SF: usize = 21;
pub const INV_WH: usize = 22; // acc32, 2 regs
pub const INV_WH_SF: usize = 24;
pub const INV_DCA: usize = 25;
pub const INV_DCA_SF: usize = 26;
pub const INV_DCV: usize = 27;
pub const INV_DCV_SF: usize = 28;
pub const INV_DCW: usize = 29;
pub const INV_DCW_SF: usize = 30;
pub const INV_TMP_CAB: usize = 31;
pub const INV_TMP_SNK: usize = 32;
pub const INV_TMP_TRNS: usize = 33;
pub const INV_TMP_OT: usize = 34;
pub const INV_TMP_SF: usize = 35;
pub const INV_ST: usize = 36;
pub const INV_ST_VND: usize = 37;
pub const INV_EVT1: usize = 38; // 32-bit
pub const INV_EVT2: usize = 40; // 32-bit
pub const INV_EVT_VND1: usize = 42;
pub const INV_EVT_VND2: usize = 44;
pub const INV_EVT_VND3: usize = 46;
pub const INV_EVT_VND4: usize = 48;

// Offsets within the Model 123 payload
pub const CTL_CONN: usize = 2;
pub const CTL_WMAX_LIM_PCT_SF: usize = 3;
pub const CTL_WMAX_LIM_PCT: usize = 5;
pub const CTL_WMAX_LIM_ENA: usize = 8;

/// The fixed scale factors of the served inverter block.
pub const A_SF: i16 = -2;
pub const V_SF: i16 = -1;
pub const W_SF: i16 = 0;
pub const HZ_SF: i16 = -2;
pub const VA_SF: i16 = 0;
pub const VAR_SF: i16 = 0;
pub const PF_SF: i16 = -2;
pub const WH_SF: i16 = 0;
pub const DCA_SF: i16 = -2;
pub const DCV_SF: i16 = -1;
pub const DCW_SF: i16 = 0;
pub const TMP_SF: i16 = -1;

/// SunSpec inverter operating state (`St`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum OperatingState {
    Off = 1,
    Sleeping = 2,
    Starting = 3,
    Mppt = 4,
    Throttled = 5,
    ShuttingDown = 6,
    Fault = 7,
    Standby = 8,
}

impl OperatingState {
    pub fn name(raw: u16) -> &'static str {
        match Self::try_from(raw) {
            Ok(OperatingState::Off) => "Off",
            Ok(OperatingState::Sleeping) => "Sleeping",
            Ok(OperatingState::Starting) => "Starting",
            Ok(OperatingState::Mppt) => "MPPT",
            Ok(OperatingState::Throttled) => "Throttled",
            Ok(OperatingState::ShuttingDown) => "Shutting Down",
            Ok(OperatingState::Fault) => "Fault",
            Ok(OperatingState::Standby) => "Standby",
            Err(_) => "Unknown",
        }
    }
}

/// Pack a string as big-endian character pairs, zero-padded.
pub fn pack_string(regs: &mut [u16], s: &str) {
    for r in regs.iter_mut() {
        *r = 0;
    }
    for (i, b) in s.bytes().take(regs.len() * 2).enumerate() {
        if i % 2 == 0 {
            regs[i / 2] = (b as u16) << 8;
        } else {
            regs[i / 2] |= b as u16;
        }
    }
}

/// Identity of the synthetic aggregate device, as baked into the static
/// blocks at startup.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub unit_id: u8,
    pub phases: u8,
    pub manufacturer: String,
    pub model_name: String,
    pub serial_number: String,
    pub rated_power_w: u16,
    pub rated_current_a: f32,
}

/// The model blocks this device serves, in chain order.
#[derive(Debug, Clone)]
pub enum Model {
    Common,
    Inverter,
    Nameplate,
    Controls,
    End,
}

impl Model {
    pub const CHAIN: [Model; 5] = [
        Model::Common,
        Model::Inverter,
        Model::Nameplate,
        Model::Controls,
        Model::End,
    ];

    pub fn id(&self, identity: &DeviceIdentity) -> u16 {
        match self {
            Model::Common => 1,
            Model::Inverter => {
                if identity.phases == 3 {
                    103
                } else {
                    101
                }
            }
            Model::Nameplate => 120,
            Model::Controls => 123,
            Model::End => 0xFFFF,
        }
    }

    pub fn len(&self) -> u16 {
        match self {
            Model::Common => MODEL_1_SIZE,
            Model::Inverter => MODEL_INV_SIZE,
            Model::Nameplate => MODEL_120_SIZE,
            Model::Controls => MODEL_123_SIZE,
            Model::End => 0,
        }
    }

    /// Write the model's startup payload. `payload` must be exactly
    /// `self.len()` registers; only value fields inside the inverter
    /// payload change after this.
    pub fn encode_payload(&self, payload: &mut [u16], identity: &DeviceIdentity) {
        match self {
            Model::Common => {
                for r in payload.iter_mut() {
                    *r = 0;
                }
                pack_string(&mut payload[0..16], &identity.manufacturer);
                pack_string(&mut payload[16..32], &identity.model_name);
                // payload[32..40]: options, left empty
                pack_string(&mut payload[40..48], "1.1.0");
                pack_string(&mut payload[48..64], &identity.serial_number);
                payload[64] = identity.unit_id as u16;
                payload[65] = NOT_IMPL_I16; // pad
            }
            Model::Inverter => {
                for r in payload.iter_mut() {
                    *r = NOT_IMPL_U16;
                }
                payload[INV_A_SF] = A_SF as u16;
                payload[INV_V_SF] = V_SF as u16;
                payload[INV_W_SF] = W_SF as u16;
                payload[INV_HZ_SF] = HZ_SF as u16;
                payload[INV_VA_SF] = VA_SF as u16;
                payload[INV_VAR_SF] = VAR_SF as u16;
                payload[INV_PF_SF] = PF_SF as u16;
                payload[INV_WH_SF] = WH_SF as u16;
                payload[INV_DCA_SF] = DCA_SF as u16;
                payload[INV_DCV_SF] = DCV_SF as u16;
                payload[INV_DCW_SF] = DCW_SF as u16;
                payload[INV_TMP_SF] = TMP_SF as u16;
                payload[INV_ST] = OperatingState::Sleeping.into();
                for off in [INV_EVT1, INV_EVT2] {
                    payload[off] = 0;
                    payload[off + 1] = 0;
                }
                for off in [INV_EVT_VND1, INV_EVT_VND2, INV_EVT_VND3, INV_EVT_VND4] {
                    payload[off] = 0;
                    payload[off + 1] = 0;
                }
            }
            Model::Nameplate => {
                for r in payload.iter_mut() {
                    *r = NOT_IMPL_U16;
                }
                payload[0] = 4; // DERTyp = PV
                payload[1] = identity.rated_power_w; // WRtg
                payload[2] = 0; // WRtg_SF
                payload[3] = identity.rated_power_w; // VARtg
                payload[4] = 0; // VARtg_SF
                payload[10] = (identity.rated_current_a * 10.0).round() as u16; // ARtg
                payload[11] = (-1i16) as u16; // ARtg_SF
            }
            Model::Controls => {
                for r in payload.iter_mut() {
                    *r = NOT_IMPL_U16;
                }
                payload[CTL_CONN] = 1;
                payload[CTL_WMAX_LIM_PCT_SF] = (-1i16) as u16;
                payload[CTL_WMAX_LIM_PCT] = 1000; // 100.0%
                payload[CTL_WMAX_LIM_ENA] = 0;
            }
            Model::End => {}
        }
    }
}
