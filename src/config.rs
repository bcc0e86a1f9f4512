use crate::prelude::*;
use crate::hoymiles::catalog;

use serde::Deserialize;

pub const MAX_RTU_SOURCES: usize = 8;
pub const MAX_TCP_CLIENTS: usize = 4;

const MAX_IDENTITY_LEN: usize = 31;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_tcp_port")]
    tcp_port: u16,

    #[serde(default = "Config::default_unit_id")]
    unit_id: u8,

    #[serde(default = "Config::default_phases")]
    phases: u8,

    #[serde(default = "Config::default_rated_voltage", alias = "rated_voltage_v")]
    rated_voltage: u16,

    #[serde(default = "Config::default_manufacturer")]
    manufacturer: String,

    #[serde(default = "Config::default_model_name")]
    model_name: String,

    #[serde(default = "Config::default_serial_number")]
    serial_number: String,

    serial_port: String,

    #[serde(default = "Config::default_baud_rate")]
    baud_rate: u32,

    #[serde(default = "Config::default_dtu_address")]
    dtu_address: u8,

    #[serde(default = "Config::default_poll_interval_ms")]
    poll_interval_ms: u32,

    #[serde(default = "Config::default_rtu_timeout_ms")]
    rtu_timeout_ms: u32,

    #[serde(default = "Config::default_loglevel")]
    loglevel: String,

    /// Optional JSON-lines file receiving every published snapshot
    snapshot_file: Option<String>,

    sources: Vec<SourceConfig>,
}

// SourceConfig {{{
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    port_number: u8,

    pub name: String,

    #[serde(default)]
    pub model: String,

    /// 1 or 3; defaults from the model catalog, else 1
    phases: Option<u8>,

    /// Grid phase (1..=3) fed by a single-phase unit
    #[serde(default = "SourceConfig::default_connected_phase")]
    connected_phase: u8,

    /// Defaults from the model catalog when the model is known
    rated_power_w: Option<u16>,

    mppt_inputs: Option<u8>,

    serial: Option<String>,
}

impl SourceConfig {
    fn default_connected_phase() -> u8 {
        1
    }

    fn catalog_spec(&self) -> Option<&'static catalog::ModelSpec> {
        catalog::lookup(&self.model)
    }

    pub fn port_number(&self) -> u8 {
        self.port_number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn phases(&self) -> u8 {
        self.phases
            .or_else(|| self.catalog_spec().map(|m| m.phases))
            .unwrap_or(1)
    }

    pub fn connected_phase(&self) -> u8 {
        self.connected_phase
    }

    pub fn rated_power_w(&self) -> u16 {
        self.rated_power_w
            .or_else(|| self.catalog_spec().map(|m| m.rated_power_w))
            .unwrap_or(0)
    }

    pub fn mppt_inputs(&self) -> u8 {
        self.mppt_inputs
            .or_else(|| self.catalog_spec().map(|m| m.mppt_inputs))
            .unwrap_or(1)
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("at least one source must be configured");
        }
        if self.sources.len() > MAX_RTU_SOURCES {
            bail!(
                "{} sources configured, maximum is {}",
                self.sources.len(),
                MAX_RTU_SOURCES
            );
        }
        if self.phases != 1 && self.phases != 3 {
            bail!("phases must be 1 or 3, got {}", self.phases);
        }
        for s in &self.sources {
            let phases = s.phases();
            if phases != 1 && phases != 3 {
                bail!("source '{}': phases must be 1 or 3", s.name);
            }
            if phases == 1 && !(1..=3).contains(&s.connected_phase) {
                bail!(
                    "source '{}': connected_phase must be 1..=3, got {}",
                    s.name,
                    s.connected_phase
                );
            }
            if s.rated_power_w() == 0 {
                bail!(
                    "source '{}': unknown model '{}' and no rated_power_w given",
                    s.name,
                    s.model
                );
            }
        }
        for (what, value) in [
            ("manufacturer", &self.manufacturer),
            ("model_name", &self.model_name),
            ("serial_number", &self.serial_number),
        ] {
            if value.len() > MAX_IDENTITY_LEN {
                bail!("{} exceeds {} characters", what, MAX_IDENTITY_LEN);
            }
        }
        Ok(())
    }

    fn default_tcp_port() -> u16 {
        502
    }
    fn default_unit_id() -> u8 {
        126
    }
    fn default_phases() -> u8 {
        1
    }
    fn default_rated_voltage() -> u16 {
        230
    }
    fn default_manufacturer() -> String {
        "Hoymiles".to_string()
    }
    fn default_model_name() -> String {
        "Hoymiles Aggregate".to_string()
    }
    fn default_serial_number() -> String {
        "HM-BRIDGE-001".to_string()
    }
    fn default_baud_rate() -> u32 {
        9600
    }
    fn default_dtu_address() -> u8 {
        126
    }
    fn default_poll_interval_ms() -> u32 {
        5000
    }
    fn default_rtu_timeout_ms() -> u32 {
        3000
    }
    fn default_loglevel() -> String {
        "info".to_string()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn phases(&self) -> u8 {
        self.phases
    }

    pub fn rated_voltage(&self) -> u16 {
        self.rated_voltage
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn serial_port(&self) -> &str {
        &self.serial_port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn dtu_address(&self) -> u8 {
        self.dtu_address
    }

    pub fn poll_interval_ms(&self) -> u32 {
        self.poll_interval_ms
    }

    pub fn rtu_timeout_ms(&self) -> u32 {
        self.rtu_timeout_ms
    }

    pub fn loglevel(&self) -> String {
        self.loglevel.clone()
    }

    pub fn snapshot_file(&self) -> Option<&str> {
        self.snapshot_file.as_deref()
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Summed nameplate power of all sources.
    pub fn rated_power_w(&self) -> u16 {
        self.sources.iter().map(|s| s.rated_power_w()).sum()
    }

    /// Summed nameplate current at the configured nominal voltage.
    pub fn rated_current_a(&self) -> f32 {
        if self.rated_voltage == 0 {
            return 0.0;
        }
        self.sources
            .iter()
            .map(|s| s.rated_power_w() as f32 / self.rated_voltage as f32)
            .sum()
    }

    pub fn identity(&self) -> sunspec::model::DeviceIdentity {
        sunspec::model::DeviceIdentity {
            unit_id: self.unit_id,
            phases: self.phases,
            manufacturer: self.manufacturer.clone(),
            model_name: self.model_name.clone(),
            serial_number: self.serial_number.clone(),
            rated_power_w: self.rated_power_w(),
            rated_current_a: self.rated_current_a(),
        }
    }
}
