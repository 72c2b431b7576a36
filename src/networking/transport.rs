//! UDP transport layer.
//!
//! Owns the socket and nothing else. Inbound datagrams are parsed into
//! [`Packet`]s on the receive task and forwarded over a channel; decode
//! failures are counted and dropped without disturbing the loop.

use crate::networking::codec::{Packet, MAX_DATAGRAM};
use crate::networking::{NetworkError, NetworkResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local bind address (0.0.0.0:0 for any).
    pub bind_addr: SocketAddr,
    /// Maximum datagram size.
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("static addr"),
            max_packet_size: MAX_DATAGRAM,
        }
    }
}

/// Counters kept by the receive loop.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub oversized_dropped: AtomicU64,
}

/// UDP socket plus receive task.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    local_addr: SocketAddr,
    /// Cleared on disconnect; while false no outbound datagram leaves.
    send_enabled: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl UdpTransport {
    pub async fn bind(config: TransportConfig) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            config,
            local_addr,
            send_enabled: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Gate outbound traffic. After `set_send_enabled(false)` no datagram
    /// is emitted until re-enabled by the next connect.
    pub fn set_send_enabled(&self, enabled: bool) {
        self.send_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn send_enabled(&self) -> bool {
        self.send_enabled.load(Ordering::SeqCst)
    }

    /// Send one raw datagram.
    pub async fn send_datagram(&self, data: Bytes, peer: SocketAddr) -> NetworkResult<()> {
        if !self.send_enabled() {
            trace!("outbound gate closed, dropping {} bytes to {}", data.len(), peer);
            return Err(NetworkError::CircuitInactive);
        }
        if data.len() > self.config.max_packet_size {
            self.stats.oversized_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetworkError::Transport {
                reason: format!("datagram of {} bytes exceeds MTU", data.len()),
            });
        }
        self.socket.send_to(&data, peer).await?;
        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Spawn the receive loop. Parsed packets are delivered with their
    /// source address; the loop runs until the socket errors or the
    /// receiver side is dropped.
    pub fn spawn_receive_loop(&self) -> mpsc::UnboundedReceiver<(Packet, SocketAddr)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Arc::clone(&self.socket);
        let stats = Arc::clone(&self.stats);
        let max = self.config.max_packet_size;

        tokio::spawn(async move {
            let mut buf = vec![0u8; max];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("receive loop terminated: {}", err);
                        break;
                    }
                };
                stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

                match Packet::parse(&buf[..len]) {
                    Ok(packet) => {
                        if tx.send((packet, peer)).is_err() {
                            debug!("packet receiver dropped, stopping receive loop");
                            break;
                        }
                    }
                    Err(err) => {
                        // Recoverable: drop and continue receiving.
                        stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping undecodable datagram from {}: {}", peer, err);
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::codec::PacketFlags;

    async fn pair() -> (UdpTransport, UdpTransport) {
        let a = UdpTransport::bind(TransportConfig::default()).await.unwrap();
        let b = UdpTransport::bind(TransportConfig::default()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let (a, b) = pair().await;
        let mut rx = b.spawn_receive_loop();

        let packet = Packet::new(PacketFlags::empty(), 1, 31, Bytes::from_static(&[7]));
        a.send_datagram(packet.serialize().unwrap(), b.local_addr())
            .await
            .unwrap();

        let (received, peer) = rx.recv().await.unwrap();
        assert_eq!(received, packet);
        assert_eq!(peer, a.local_addr());
    }

    #[tokio::test]
    async fn test_undecodable_datagram_is_counted_and_dropped() {
        let (a, b) = pair().await;
        let mut rx = b.spawn_receive_loop();

        a.send_datagram(Bytes::from_static(&[1, 2, 3]), b.local_addr())
            .await
            .unwrap();
        let good = Packet::new(PacketFlags::empty(), 2, 31, Bytes::new());
        a.send_datagram(good.serialize().unwrap(), b.local_addr())
            .await
            .unwrap();

        // Only the well-formed packet comes through.
        let (received, _) = rx.recv().await.unwrap();
        assert_eq!(received.sequence, 2);
        assert_eq!(b.stats().decode_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_outbound_gate() {
        let (a, b) = pair().await;
        a.set_send_enabled(false);
        let err = a
            .send_datagram(Bytes::from_static(&[0; 16]), b.local_addr())
            .await;
        assert!(err.is_err());
        assert_eq!(a.stats().datagrams_sent.load(Ordering::Relaxed), 0);
    }
}
