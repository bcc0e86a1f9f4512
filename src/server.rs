//! Modbus TCP server.
//!
//! One listener, up to `MAX_TCP_CLIENTS` concurrent clients; surplus
//! connections are closed at accept. Incoming streams are framed by the
//! MBAP length field, so pipelined requests on one connection are
//! answered in order. Requests are forwarded to the coordinator, which
//! owns the register image.

use crate::config::MAX_TCP_CLIENTS;
use crate::coordinator::ModbusRequest;
use crate::prelude::*;

use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Decoder;

const MAX_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub enum ChannelData {
    Shutdown,
}

/// One MBAP-framed request: `[txn(2)][proto(2)][length(2)][unit(1)][pdu..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapFrame {
    pub txn: u16,
    pub proto: u16,
    pub unit: u8,
    pub pdu: Vec<u8>,
}

/// Splits the byte stream into MBAP frames. The length field covers
/// unit + PDU; anything outside 2..=254 means the stream is corrupt and
/// the connection must go.
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MbapFrame>> {
        if buf.len() < 7 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if !(2..=254).contains(&length) {
            bail!("invalid MBAP length {}", length);
        }
        if buf.len() < 6 + length {
            return Ok(None);
        }

        let frame = buf.split_to(6 + length);
        Ok(Some(MbapFrame {
            txn: u16::from_be_bytes([frame[0], frame[1]]),
            proto: u16::from_be_bytes([frame[2], frame[3]]),
            unit: frame[6],
            pdu: frame[7..].to_vec(),
        }))
    }
}

pub fn encode_mbap(txn: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu.len());
    out.extend_from_slice(&txn.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(1 + pdu.len() as u16).to_be_bytes());
    out.push(unit);
    out.extend_from_slice(pdu);
    out
}

#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    channels: Channels,
    slots: Arc<Mutex<[bool; MAX_TCP_CLIENTS]>>,
}

impl Server {
    pub fn new(config: Arc<Config>, channels: Channels) -> Self {
        Self {
            config,
            channels,
            slots: Arc::new(Mutex::new([false; MAX_TCP_CLIENTS])),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.tcp_port());
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                // The RTU side keeps running without a listener; there
                // is no retry.
                error!("tcp: bind {} failed: {}", addr, e);
                return Ok(());
            }
        };
        info!(
            "tcp: listening on {} (unit id {})",
            addr,
            self.config.unit_id()
        );

        let mut shutdown = self.channels.to_server.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.place_client(socket, peer),
                    Err(e) => warn!("tcp: accept failed: {}", e),
                },
                msg = shutdown.recv() => match msg {
                    Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                },
            }
        }

        info!("tcp: listener exiting");
        Ok(())
    }

    fn place_client(&self, socket: TcpStream, peer: std::net::SocketAddr) {
        let slot = {
            let mut slots = self.slots.lock().expect("slot mutex poisoned");
            match slots.iter().position(|used| !used) {
                Some(i) => {
                    slots[i] = true;
                    i
                }
                None => {
                    warn!("tcp: no slot available, rejecting {}", peer);
                    return; // socket drops closed
                }
            }
        };

        info!("tcp: client connected from {} (slot {})", peer, slot);
        let _ = self
            .channels
            .to_coordinator
            .send(coordinator::ChannelData::ClientConnected(slot));

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_client(socket, slot).await {
                warn!("tcp: client slot {} error: {}", slot, e);
            } else {
                info!("tcp: client slot {} disconnected", slot);
            }
            server.slots.lock().expect("slot mutex poisoned")[slot] = false;
            let _ = server
                .channels
                .to_coordinator
                .send(coordinator::ChannelData::ClientDisconnected(slot));
        });
    }

    async fn serve_client(&self, mut socket: TcpStream, slot: usize) -> Result<()> {
        let mut buf = BytesMut::with_capacity(1024);
        let mut decoder = MbapCodec;
        let mut shutdown = self.channels.to_server.subscribe();

        loop {
            tokio::select! {
                msg = shutdown.recv() => match msg {
                    Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                },
                read = socket.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => return Ok(()), // orderly close
                        Ok(_) => {}
                        Err(e) => bail!("read: {}", e),
                    }
                    if buf.len() > MAX_BUFFER_SIZE {
                        bail!("request buffer overflow ({} bytes)", buf.len());
                    }

                    while let Some(frame) = decoder.decode(&mut buf)? {
                        trace!(
                            "tcp RX: slot {} txn={} unit={} {} byte pdu",
                            slot, frame.txn, frame.unit, frame.pdu.len()
                        );
                        let (request, reply) =
                            ModbusRequest::new(frame.proto, frame.unit, frame.pdu);
                        if self
                            .channels
                            .to_coordinator
                            .send(coordinator::ChannelData::Request(request))
                            .is_err()
                        {
                            bail!("coordinator not running");
                        }
                        match reply.await {
                            Ok(Some(pdu)) => {
                                socket
                                    .write_all(&encode_mbap(frame.txn, frame.unit, &pdu))
                                    .await?;
                            }
                            Ok(None) => {} // dropped silently
                            Err(_) => bail!("coordinator dropped request"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x7E]);
        assert_eq!(MbapCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[0x03, 0x9C, 0x40, 0x00, 0x0A]);
        let frame = MbapCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.txn, 1);
        assert_eq!(frame.proto, 0);
        assert_eq!(frame.unit, 0x7E);
        assert_eq!(frame.pdu, vec![0x03, 0x9C, 0x40, 0x00, 0x0A]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_splits_pipelined_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_mbap(1, 126, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        buf.extend_from_slice(&encode_mbap(2, 126, &[0x03, 0x00, 0x02, 0x00, 0x01]));

        let first = MbapCodec.decode(&mut buf).unwrap().unwrap();
        let second = MbapCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.txn, 1);
        assert_eq!(second.txn, 2);
        assert_eq!(MbapCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_rejects_broken_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x7E]);
        assert!(MbapCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_layout() {
        let frame = encode_mbap(0x1234, 126, &[0x03, 0x02, 0xAA, 0xBB]);
        assert_eq!(
            frame,
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 126, 0x03, 0x02, 0xAA, 0xBB]
        );
    }
}
