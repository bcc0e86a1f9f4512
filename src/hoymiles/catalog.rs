//! Hoymiles microinverter model database.
//!
//! Series overview:
//! - HM-xxx: legacy single-phase (2.4GHz RF)
//! - HMS-xxx-1T/2T/4T: single-phase, 1/2/4 panels
//! - HMT-xxxx-4T/6T: three-phase
//! - MIT-xxxx-8T: three-phase, high-power commercial

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub model_name: &'static str,
    pub rated_power_w: u16,
    pub mppt_inputs: u8,
    pub panel_inputs: u8,
    pub phases: u8,
    pub max_vdc: u16,
    /// Maximum DC current per input, in tenths of an ampere.
    pub max_idc_per_input: u16,
    pub mppt_vmin: u16,
    pub mppt_vmax: u16,
}

const fn spec(
    model_name: &'static str,
    rated_power_w: u16,
    mppt_inputs: u8,
    panel_inputs: u8,
    phases: u8,
    max_vdc: u16,
    max_idc_per_input: u16,
    mppt_vmin: u16,
    mppt_vmax: u16,
) -> ModelSpec {
    ModelSpec {
        model_name,
        rated_power_w,
        mppt_inputs,
        panel_inputs,
        phases,
        max_vdc,
        max_idc_per_input,
        mppt_vmin,
        mppt_vmax,
    }
}

pub static MODELS: &[ModelSpec] = &[
    // Legacy HM series
    spec("HM-300", 300, 1, 1, 1, 60, 105, 22, 48),
    spec("HM-350", 350, 1, 1, 1, 60, 105, 22, 48),
    spec("HM-400", 400, 1, 1, 1, 60, 105, 22, 48),
    spec("HM-600", 600, 1, 2, 1, 60, 115, 22, 48),
    spec("HM-700", 700, 1, 2, 1, 60, 115, 22, 48),
    spec("HM-800", 800, 1, 2, 1, 60, 115, 22, 48),
    spec("HM-1200", 1200, 2, 4, 1, 60, 115, 22, 48),
    spec("HM-1500", 1500, 2, 4, 1, 60, 115, 22, 48),
    // HMS single-panel series
    spec("HMS-300-1T", 300, 1, 1, 1, 60, 115, 16, 60),
    spec("HMS-350-1T", 350, 1, 1, 1, 60, 115, 16, 60),
    spec("HMS-400-1T", 400, 1, 1, 1, 65, 125, 16, 60),
    spec("HMS-450-1T", 450, 1, 1, 1, 65, 133, 16, 60),
    spec("HMS-500-1T", 500, 1, 1, 1, 65, 140, 16, 60),
    // HMS dual-panel series, shared MPPT
    spec("HMS-600-2T", 600, 1, 2, 1, 60, 115, 16, 60),
    spec("HMS-700-2T", 700, 1, 2, 1, 60, 115, 16, 60),
    spec("HMS-800-2T", 800, 1, 2, 1, 65, 125, 16, 60),
    spec("HMS-900-2T", 900, 1, 2, 1, 65, 133, 16, 60),
    spec("HMS-1000-2T", 1000, 1, 2, 1, 65, 140, 16, 60),
    // HMS quad-panel series, independent MPPTs
    spec("HMS-1600-4T", 1600, 4, 4, 1, 65, 125, 16, 60),
    spec("HMS-1800-4T", 1800, 4, 4, 1, 65, 133, 16, 60),
    spec("HMS-2000-4T", 2000, 4, 4, 1, 65, 140, 16, 60),
    // HMT three-phase quad-panel series
    spec("HMT-1600-4T", 1600, 4, 4, 3, 65, 125, 16, 60),
    spec("HMT-1800-4T", 1800, 4, 4, 3, 65, 133, 16, 60),
    spec("HMT-2000-4T", 2000, 4, 4, 3, 65, 140, 16, 60),
    // HMT three-phase 6-panel series
    spec("HMT-2250-6T", 2250, 3, 6, 3, 65, 140, 16, 60),
    // MIT three-phase 8-panel series
    spec("MIT-4000-8T", 4000, 4, 8, 3, 140, 200, 29, 120),
    spec("MIT-4500-8T", 4500, 4, 8, 3, 140, 200, 29, 120),
    spec("MIT-5000-8T", 5000, 4, 8, 3, 140, 200, 29, 120),
];

/// Lookup by model name, case-insensitive. `None` means unknown model;
/// callers fall back to configured ratings.
pub fn lookup(model_name: &str) -> Option<&'static ModelSpec> {
    MODELS
        .iter()
        .find(|m| m.model_name.eq_ignore_ascii_case(model_name))
}
