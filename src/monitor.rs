//! Observable state of the gateway.
//!
//! The coordinator publishes a `Snapshot` every few seconds; this task
//! logs the interesting transitions and optionally appends each snapshot
//! as a JSON line to a file for external tooling.

use crate::prelude::*;
use crate::source::PollStats;

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum ChannelData {
    Snapshot(Box<Snapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub name: String,
    pub model: String,
    pub serial: Option<String>,
    pub online: bool,
    pub status: String,
    pub power_w: f32,
    pub voltage_v: f32,
    pub current_a: f32,
    pub frequency_hz: f32,
    pub energy_kwh: f32,
    pub today_energy_wh: u32,
    pub temperature_c: f32,
    pub pv_voltage_v: f32,
    pub pv_current_a: f32,
    pub pv_power_w: f32,
    pub alarm_code: u16,
    pub link_status: u8,
    pub operating_status: u16,
    pub stats: PollStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub power_w: f32,
    pub current_a: f32,
    pub voltage_v: f32,
    pub frequency_hz: f32,
    pub energy_kwh: f32,
    pub state: String,
    pub valid_sources: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub active_clients: usize,
    pub request_count: u64,
    pub error_count: u64,
    pub downstream: String,
    pub limit_pct: f32,
    pub limit_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub sources: Vec<SourceSnapshot>,
    pub aggregate: AggregateSnapshot,
    pub server: ServerSnapshot,
}

#[derive(Clone)]
pub struct Monitor {
    channels: Channels,
    writer: Option<SnapshotWriter>,
    last_downstream: Arc<Mutex<String>>,
}

impl Monitor {
    pub fn new(config: Arc<Config>, channels: Channels) -> Result<Self> {
        let writer = match config.snapshot_file() {
            Some(path) => Some(SnapshotWriter::new(path)?),
            None => None,
        };
        Ok(Self {
            channels,
            writer,
            last_downstream: Arc::new(Mutex::new(String::new())),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.channels.from_coordinator.subscribe();

        loop {
            match receiver.recv().await {
                Ok(ChannelData::Snapshot(snapshot)) => self.publish(&snapshot),
                Ok(ChannelData::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("monitor: lagged by {} snapshots", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("monitor: exiting");
        Ok(())
    }

    fn publish(&self, snapshot: &Snapshot) {
        for s in &snapshot.sources {
            debug!(
                "source '{}' [{}]: {} (alarms={}, link={}, ok={}, fail={})",
                s.name,
                s.serial.as_deref().unwrap_or("-"),
                s.status,
                s.alarm_code,
                s.link_status,
                s.stats.poll_success,
                s.stats.poll_fail + s.stats.poll_timeout + s.stats.crc_error
            );
        }

        // downstream state logs only on change
        if let Ok(mut last) = self.last_downstream.lock() {
            if *last != snapshot.server.downstream {
                info!(
                    "downstream: {} ({} clients, limit {:.1}%{})",
                    snapshot.server.downstream,
                    snapshot.server.active_clients,
                    snapshot.server.limit_pct,
                    if snapshot.server.limit_enabled {
                        ""
                    } else {
                        " off"
                    }
                );
                *last = snapshot.server.downstream.clone();
            }
        }

        if let Some(writer) = &self.writer {
            if let Err(e) = writer.append(snapshot) {
                error!("monitor: snapshot write failed: {}", e);
            }
        }
    }
}

/// Appends snapshots as JSON lines, one object per publish.
#[derive(Clone)]
struct SnapshotWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl SnapshotWriter {
    fn new(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("monitor: appending snapshots to {}", path);
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn append(&self, snapshot: &Snapshot) -> Result<()> {
        let mut record = serde_json::to_value(snapshot)?;
        if let Some(map) = record.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("snapshot file lock poisoned"))?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            sources: vec![SourceSnapshot {
                name: "garage".into(),
                model: "HMS-800-2T".into(),
                serial: Some("1123801654".into()),
                online: true,
                status: "Producing 650W".into(),
                power_w: 650.0,
                voltage_v: 230.0,
                current_a: 2.83,
                frequency_hz: 49.99,
                energy_kwh: 12.34,
                today_energy_wh: 1234,
                temperature_c: 42.0,
                pv_voltage_v: 33.0,
                pv_current_a: 9.5,
                pv_power_w: 650.0,
                alarm_code: 0,
                link_status: 1,
                operating_status: 3,
                stats: PollStats::default(),
            }],
            aggregate: AggregateSnapshot {
                power_w: 650.0,
                current_a: 2.83,
                voltage_v: 230.0,
                frequency_hz: 49.99,
                energy_kwh: 12.34,
                state: "MPPT".into(),
                valid_sources: 1,
            },
            server: ServerSnapshot {
                active_clients: 1,
                request_count: 42,
                error_count: 0,
                downstream: "Active (42 reqs)".into(),
                limit_pct: 100.0,
                limit_enabled: false,
            },
        }
    }

    #[test]
    fn writer_appends_json_lines() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let writer = SnapshotWriter::new(temp_file.path().to_str().unwrap())?;

        writer.append(&sample_snapshot())?;
        writer.append(&sample_snapshot())?;

        let contents = std::fs::read_to_string(temp_file.path())?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let json: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(json["aggregate"]["state"], "MPPT");
        assert_eq!(json["sources"][0]["name"], "garage");
        assert_eq!(json["server"]["request_count"], 42);
        assert!(json["timestamp"].is_string());

        Ok(())
    }
}
