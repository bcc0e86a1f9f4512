use crate::prelude::*;

use crate::aggregator::{self, AggregateReading};
use crate::hoymiles::command;
use crate::hoymiles::port_data::PortData;
use crate::monitor::{AggregateSnapshot, ServerSnapshot, Snapshot, SourceSnapshot};
use crate::source::PollStats;
use crate::sunspec::image::RegisterImage;
use crate::sunspec::model::{self, OperatingState};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SNAPSHOT_INTERVAL_MS: u64 = 5000;

/// TCP traffic younger than this counts as an active downstream manager.
const DOWNSTREAM_ACTIVE_SECS: u64 = 30;

/// A source is stale once its data is older than three poll rounds.
const STALE_FACTOR: u32 = 3;

// Modbus function codes served downstream
const FC_READ_HOLDING: u8 = 0x03;
const FC_WRITE_SINGLE: u8 = 0x06;
const FC_WRITE_MULTIPLE: u8 = 0x10;

const MAX_READ_COUNT: u16 = 125;
const MAX_WRITE_COUNT: u16 = 100;

/// One MBAP-framed request forwarded by the TCP server. The reply
/// carries the response PDU, or `None` when the request must be dropped
/// without an answer.
#[derive(Debug, Clone)]
pub struct ModbusRequest {
    pub proto: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
    pub reply: Arc<Mutex<Option<oneshot::Sender<Option<Vec<u8>>>>>>,
}

impl ModbusRequest {
    pub fn new(proto: u16, unit_id: u8, pdu: Vec<u8>) -> (Self, oneshot::Receiver<Option<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                proto,
                unit_id,
                pdu,
                reply: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    fn respond(&self, response: Option<Vec<u8>>) {
        if let Ok(mut tx) = self.reply.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(response);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChannelData {
    Request(ModbusRequest),
    ClientConnected(usize),
    ClientDisconnected(usize),
    Shutdown,
}

/// Counters surfaced in snapshots and the shutdown summary.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub tcp_request_count: u64,
    pub tcp_error_count: u64,
    pub active_clients: usize,
    pub last_tcp_activity: Option<Instant>,
    pub source_stats: Vec<(String, PollStats)>,
}

impl GatewayStats {
    pub fn print_summary(&self) {
        info!("Gateway statistics:");
        info!("  TCP requests served: {}", self.tcp_request_count);
        info!("  TCP errors: {}", self.tcp_error_count);
        info!("  Poll results by source:");
        for (name, stats) in &self.source_stats {
            info!(
                "    {}: ok={} fail={} timeout={} crc={}",
                name, stats.poll_success, stats.poll_fail, stats.poll_timeout, stats.crc_error
            );
        }
    }
}

/// Sole owner of the register image and the per-source state. All
/// mutation funnels through its channel receivers, which is what makes
/// lock-free reads and writes of the image sound.
pub struct Coordinator {
    config: Arc<Config>,
    channels: Channels,
    sources: Vec<Source>,
    image: RegisterImage,
    reading: AggregateReading,
    pub stats: Arc<Mutex<GatewayStats>>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, channels: Channels) -> Self {
        let sources: Vec<Source> = config.sources().iter().map(Source::from_config).collect();

        let mut image = RegisterImage::new();
        let identity = config.identity();
        image.build_static(&identity);
        info!(
            "serving '{}' / '{}' / '{}' as unit {} ({} phase, {}W rated)",
            identity.manufacturer,
            identity.model_name,
            identity.serial_number,
            identity.unit_id,
            identity.phases,
            identity.rated_power_w
        );

        let stats = Arc::new(Mutex::new(GatewayStats {
            source_stats: sources
                .iter()
                .map(|s| (s.name.clone(), PollStats::default()))
                .collect(),
            ..GatewayStats::default()
        }));

        Self {
            config,
            channels,
            sources,
            image,
            reading: AggregateReading::default(),
            stats,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        let mut bus_rx = self.channels.from_bus.subscribe();
        let mut requests = self.channels.to_coordinator.subscribe();
        let mut publish = tokio::time::interval(Duration::from_millis(SNAPSHOT_INTERVAL_MS));

        loop {
            tokio::select! {
                msg = bus_rx.recv() => match msg {
                    Ok(poller::ChannelData::PollResult { source, outcome }) => {
                        self.handle_poll_result(source, outcome);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("coordinator: poll channel lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = requests.recv() => match msg {
                    Ok(ChannelData::Request(req)) => {
                        let response = self.handle_request(&req);
                        req.respond(response);
                    }
                    Ok(ChannelData::ClientConnected(slot)) => {
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.active_clients += 1;
                            debug!("coordinator: client slot {} active ({} total)", slot, stats.active_clients);
                        }
                    }
                    Ok(ChannelData::ClientDisconnected(slot)) => {
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.active_clients = stats.active_clients.saturating_sub(1);
                            debug!("coordinator: client slot {} gone ({} left)", slot, stats.active_clients);
                        }
                    }
                    Ok(ChannelData::Shutdown) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("coordinator: request channel lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = publish.tick() => self.publish_snapshot(),
            }
        }

        info!("coordinator: exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_bus.send(poller::BusCommand::Shutdown);
        let _ = self.channels.to_server.send(server::ChannelData::Shutdown);
        let _ = self
            .channels
            .from_coordinator
            .send(monitor::ChannelData::Shutdown);
        let _ = self.channels.to_coordinator.send(ChannelData::Shutdown);
    }

    // ---- RTU side ----------------------------------------------------

    fn handle_poll_result(&mut self, source: usize, outcome: Result<Vec<u16>, RtuError>) {
        let Some(s) = self.sources.get_mut(source) else {
            warn!("poll result for unknown source {}", source);
            return;
        };

        match outcome {
            Ok(regs) => match PortData::parse(&regs) {
                Ok(data) => {
                    debug!(
                        "bus RX: '{}' (port {}) P={:.0}W V={:.0}V I={:.2}A f={:.2}Hz T={:.0}C E={:.1}kWh",
                        s.name,
                        s.port_number,
                        data.power_w,
                        data.voltage_v,
                        data.current_a,
                        data.frequency_hz,
                        data.temperature_c,
                        data.lifetime_energy_wh as f32 / 1000.0
                    );
                    s.apply_block(data, Instant::now());
                    self.reading =
                        aggregator::aggregate(&self.sources, self.config.phases(), &mut self.image);
                }
                Err(e) => {
                    warn!("bus RX: '{}': {}", s.name, e);
                    s.stats.poll_fail += 1;
                }
            },
            Err(e) => {
                warn!(
                    "bus RX: '{}' (DTU {}, port {}): {}",
                    s.name,
                    self.config.dtu_address(),
                    s.port_number,
                    e
                );
                s.record_failure(&e);
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            if let Some(slot) = stats.source_stats.get_mut(source) {
                slot.1 = self.sources[source].stats;
            }
        }
    }

    // ---- TCP side ----------------------------------------------------

    /// Dispatch one request PDU against the register image. `None` means
    /// no bytes go back on the wire.
    pub fn handle_request(&mut self, req: &ModbusRequest) -> Option<Vec<u8>> {
        if req.proto != 0 {
            return None;
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.last_tcp_activity = Some(Instant::now());
            stats.tcp_request_count += 1;
        }

        if req.unit_id != self.config.unit_id() {
            debug!(
                "tcp: request for unit {} (we are {}), ignoring",
                req.unit_id,
                self.config.unit_id()
            );
            return None;
        }

        if req.pdu.is_empty() {
            return None;
        }
        let fc = req.pdu[0];
        let result = match fc {
            FC_READ_HOLDING => self.read_holding(&req.pdu),
            FC_WRITE_SINGLE => self.write_single(&req.pdu),
            FC_WRITE_MULTIPLE => self.write_multiple(&req.pdu),
            _ => {
                warn!("tcp: unsupported function code {:#04X}", fc);
                Some(Err(ModbusFault::IllegalFunction))
            }
        };

        match result {
            Some(Ok(response)) => Some(response),
            Some(Err(fault)) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.tcp_error_count += 1;
                }
                Some(vec![fc | 0x80, fault.exception_code()])
            }
            // Truncated PDU: nothing sensible to answer
            None => None,
        }
    }

    fn read_holding(&self, pdu: &[u8]) -> Option<Result<Vec<u8>, ModbusFault>> {
        if pdu.len() < 5 {
            return None;
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let count = u16::from_be_bytes([pdu[3], pdu[4]]);
        trace!("tcp RX: read holding reg={} count={}", start, count);

        if count == 0 || count > MAX_READ_COUNT {
            warn!("tcp: read count {} out of range", count);
            return Some(Err(ModbusFault::IllegalValue));
        }

        Some(self.image.read_range(start, count).map(|regs| {
            let mut resp = Vec::with_capacity(2 + regs.len() * 2);
            resp.push(FC_READ_HOLDING);
            resp.push((regs.len() * 2) as u8);
            for reg in regs {
                resp.extend_from_slice(&reg.to_be_bytes());
            }
            resp
        }))
    }

    fn write_single(&mut self, pdu: &[u8]) -> Option<Result<Vec<u8>, ModbusFault>> {
        if pdu.len() < 5 {
            return None;
        }
        let reg = u16::from_be_bytes([pdu[1], pdu[2]]);
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);
        info!("tcp RX: write single reg={} value={}", reg, value);

        Some(self.image.write_range(reg, &[value]).map(|effect| {
            self.after_write(effect);
            pdu[..5].to_vec() // echo
        }))
    }

    fn write_multiple(&mut self, pdu: &[u8]) -> Option<Result<Vec<u8>, ModbusFault>> {
        if pdu.len() < 6 {
            return None;
        }
        let reg = u16::from_be_bytes([pdu[1], pdu[2]]);
        let count = u16::from_be_bytes([pdu[3], pdu[4]]);
        let byte_count = pdu[5] as usize;
        info!("tcp RX: write multiple reg={} count={}", reg, count);

        if count == 0
            || count > MAX_WRITE_COUNT
            || byte_count != count as usize * 2
            || pdu.len() < 6 + byte_count
        {
            return Some(Err(ModbusFault::IllegalValue));
        }

        let values: Vec<u16> = pdu[6..6 + byte_count]
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        Some(self.image.write_range(reg, &values).map(|effect| {
            self.after_write(effect);
            let mut resp = vec![FC_WRITE_MULTIPLE];
            resp.extend_from_slice(&reg.to_be_bytes());
            resp.extend_from_slice(&count.to_be_bytes());
            resp
        }))
    }

    /// Forward a changed power limit to every source.
    fn after_write(&mut self, effect: crate::sunspec::image::WriteEffect) {
        if !effect.limit_touched {
            return;
        }

        info!(
            "downstream power limit command: {:.1}%, enabled={}",
            effect.limit_pct_raw as f32 / 10.0,
            effect.limit_enabled
        );

        let ports: Vec<u8> = self.sources.iter().map(|s| s.port_number).collect();
        let writes = command::power_limit_writes(
            self.config.dtu_address(),
            &ports,
            effect.limit_pct_raw,
            effect.limit_enabled,
        );
        if self
            .channels
            .to_bus
            .send(poller::BusCommand::Write(writes))
            .is_err()
        {
            warn!("power limit command dropped: bus task not running");
        }
    }

    // ---- Snapshots ---------------------------------------------------

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        let _ = self
            .channels
            .from_coordinator
            .send(monitor::ChannelData::Snapshot(Box::new(snapshot)));
    }

    pub fn snapshot(&self) -> Snapshot {
        let now = Instant::now();
        let stale_after =
            (self.config.poll_interval_ms() as u64 / 1000).max(1) * STALE_FACTOR as u64;

        let sources = self
            .sources
            .iter()
            .map(|s| {
                let age = s.age_secs(now);
                let online = s.data_valid && age.map_or(false, |a| a < stale_after);
                let status = if !s.data_valid {
                    "No data".to_string()
                } else if !online {
                    format!("Stale ({}s)", age.unwrap_or(0))
                } else if s.decoded.producing {
                    format!("Producing {:.0}W", s.decoded.power_w)
                } else {
                    "Idle".to_string()
                };

                SourceSnapshot {
                    name: s.name.clone(),
                    model: s.model.clone(),
                    serial: s.serial().map(str::to_string),
                    online,
                    status,
                    power_w: s.decoded.power_w,
                    voltage_v: s.decoded.voltage_v,
                    current_a: s.decoded.current_a,
                    frequency_hz: s.decoded.frequency_hz,
                    energy_kwh: s.decoded.lifetime_energy_wh as f32 / 1000.0,
                    today_energy_wh: s.decoded.today_energy_wh,
                    temperature_c: s.decoded.temperature_c,
                    pv_voltage_v: s.decoded.pv_voltage_v,
                    pv_current_a: s.decoded.pv_current_a,
                    pv_power_w: s.decoded.pv_power_w,
                    alarm_code: s.decoded.alarm_code,
                    link_status: s.decoded.link_status,
                    operating_status: s.decoded.operating_status,
                    stats: s.stats,
                }
            })
            .collect();

        let aggregate = AggregateSnapshot {
            power_w: self.reading.power_w,
            current_a: self.reading.current_a,
            voltage_v: self.reading.voltage_v,
            frequency_hz: self.reading.frequency_hz,
            energy_kwh: self.reading.energy_kwh,
            state: OperatingState::name(self.image.inverter_payload()[model::INV_ST]).to_string(),
            valid_sources: self.reading.valid_sources,
        };

        let (limit_pct_raw, limit_enabled) = self.image.power_limit();
        let server = {
            let stats = self.stats.lock().expect("stats mutex poisoned");
            let recent = stats
                .last_tcp_activity
                .map_or(false, |t| now.duration_since(t).as_secs() < DOWNSTREAM_ACTIVE_SECS);
            let downstream = if stats.active_clients == 0 {
                "No connection".to_string()
            } else if !recent {
                "Connected, idle".to_string()
            } else {
                format!("Active ({} reqs)", stats.tcp_request_count)
            };
            ServerSnapshot {
                active_clients: stats.active_clients,
                request_count: stats.tcp_request_count,
                error_count: stats.tcp_error_count,
                downstream,
                limit_pct: if limit_enabled {
                    limit_pct_raw as f32 / 10.0
                } else {
                    100.0
                },
                limit_enabled,
            }
        };

        Snapshot {
            sources,
            aggregate,
            server,
        }
    }

    pub fn image(&self) -> &RegisterImage {
        &self.image
    }

    pub fn sources_mut(&mut self) -> &mut Vec<Source> {
        &mut self.sources
    }

    pub fn apply_poll_result(&mut self, source: usize, outcome: Result<Vec<u16>, RtuError>) {
        self.handle_poll_result(source, outcome)
    }
}
