//! RS-485 bus owner.
//!
//! Drives the half-duplex bus with a single in-flight request: rotates
//! through the configured sources, reads one port block per turn, and
//! executes queued command writes only between polls. Nothing else
//! touches the serial stream.

use crate::hoymiles::command::BusWrite;
use crate::hoymiles::port_data::{DATA_BASE, PORT_REGS, PORT_STRIDE};
use crate::hoymiles::frame;
use crate::prelude::*;

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

/// Result of one poll attempt, sent to the coordinator. `source` is the
/// index into the configured source list.
#[derive(Debug, Clone)]
pub enum ChannelData {
    PollResult {
        source: usize,
        outcome: Result<Vec<u16>, RtuError>,
    },
}

/// Mailbox of the bus owner. Writes are fire-and-forget frame sequences
/// drained only while no poll response is pending.
#[derive(Debug, Clone)]
pub enum BusCommand {
    Write(Vec<BusWrite>),
    Shutdown,
}

pub struct Poller<S> {
    config: Arc<Config>,
    channels: Channels,
    stream: S,
    /// DTU port number per source, index-aligned with the config
    ports: Vec<u8>,
    current_source: usize,
    buf: BytesMut,
}

impl<S> Poller<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(config: Arc<Config>, channels: Channels, stream: S) -> Self {
        let ports = config.sources().iter().map(|s| s.port_number()).collect();
        Self {
            config,
            channels,
            stream,
            ports,
            current_source: 0,
            buf: BytesMut::with_capacity(512),
        }
    }

    pub async fn start(mut self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("no sources to poll");
        }

        // Stagger bus use so every source is visited once per
        // poll_interval_ms.
        let interval =
            Duration::from_millis(self.config.poll_interval_ms() as u64 / self.ports.len() as u64);
        info!(
            "bus: polling {} sources every {:?} (DTU address {})",
            self.ports.len(),
            interval,
            self.config.dtu_address()
        );

        let mut commands = self.channels.to_bus.subscribe();
        let mut next_poll = Instant::now();

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Ok(BusCommand::Write(writes)) => self.execute_writes(writes).await,
                    Ok(BusCommand::Shutdown) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("bus: command mailbox lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep_until(next_poll) => {
                    let started = Instant::now();
                    self.poll_next().await;
                    next_poll = started + interval;
                }
            }
        }

        info!("bus: exiting");
        Ok(())
    }

    async fn poll_next(&mut self) {
        let source = self.current_source;
        let port = self.ports[source];
        let base = DATA_BASE + port as u16 * PORT_STRIDE;

        self.drain_input().await;

        trace!(
            "bus TX: reading port {} from DTU {} (regs {:#06X}..{:#06X})",
            port,
            self.config.dtu_address(),
            base,
            base + PORT_REGS - 1
        );

        let request = frame::build_read_holding(self.config.dtu_address(), base, PORT_REGS);
        if let Err(e) = self.send(&request).await {
            error!("bus: serial write failed: {}", e);
            return;
        }

        let outcome = self.await_response().await;
        let _ = self
            .channels
            .from_bus
            .send(ChannelData::PollResult { source, outcome });

        self.current_source = (self.current_source + 1) % self.ports.len();
    }

    /// Accumulate serial input until a complete frame parses or the
    /// response deadline passes.
    async fn await_response(&mut self) -> Result<Vec<u16>, RtuError> {
        self.buf.clear();
        let deadline = Instant::now() + Duration::from_millis(self.config.rtu_timeout_ms() as u64);

        loop {
            match frame::parse_response(&self.buf) {
                Ok(resp) => {
                    return if resp.fc == frame::READ_HOLDING {
                        frame::payload_registers(&resp.payload)
                    } else {
                        Err(RtuError::BadFunc)
                    };
                }
                Err(RtuError::Short) => {} // keep reading
                Err(e) => return Err(e),
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(RtuError::Timeout);
            };
            match timeout(remaining, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => return Err(RtuError::Timeout), // stream gone, nothing more will arrive
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("bus: serial read failed: {}", e);
                    return Err(RtuError::Timeout);
                }
                Err(_) => return Err(RtuError::Timeout),
            }
        }
    }

    /// Discard residual bytes (late responses, line noise) before a new
    /// request.
    async fn drain_input(&mut self) {
        let mut scratch = [0u8; 256];
        loop {
            match timeout(Duration::from_millis(1), self.stream.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => trace!("bus: drained {} stale bytes", n),
                _ => break,
            }
        }
    }

    async fn execute_writes(&mut self, writes: Vec<BusWrite>) {
        for w in writes {
            if let Err(e) = self.send(&w.frame).await {
                error!("bus: command write failed: {}", e);
                return;
            }
            tokio::time::sleep(Duration::from_millis(w.settle_ms)).await;
        }
    }

    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }
}
