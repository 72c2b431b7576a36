//! Circuit: the reliable-delivery and sequencing layer.
//!
//! One circuit per simulator connection. The circuit owns the outbound
//! sequence counter, the pending-ack map, and the duplicate-suppression
//! window; nothing else mutates them. Reliable messages are retried on
//! an adaptive timeout until acknowledged or the retry cap is reached.

use crate::networking::codec::{zerocode, Packet, PacketFlags};
use crate::networking::messages::{Message, MessageType};
use crate::networking::transport::UdpTransport;
use crate::networking::{NetworkError, NetworkResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// Upper bound on remembered inbound sequence numbers.
const RECEIVED_WINDOW: usize = 4096;

/// Dedicated `packetAck` flush threshold.
const ACK_BATCH: usize = 50;

/// Most acks a single trailer can carry.
const MAX_PIGGYBACK: usize = 255;

/// Circuit tuning knobs.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Give up on a reliable packet after this many retransmissions.
    pub retry_cap: u8,
    /// Hard deadline for a reliable packet, regardless of retries.
    pub reliable_timeout: Duration,
    /// Floor for the adaptive retransmit timeout.
    pub min_rto: Duration,
    /// Ceiling for the adaptive retransmit timeout.
    pub max_rto: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            retry_cap: 3,
            reliable_timeout: Duration::from_secs(10),
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(8),
        }
    }
}

/// Events surfaced to the owner of the circuit.
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    /// A non-duplicate inbound packet, ready for routing.
    Inbound(Packet),
    /// A reliable packet exhausted its retries.
    ReliableDeliveryFailed { sequence: u32, message_type: u32 },
}

/// A reliable packet awaiting acknowledgment.
#[derive(Debug)]
struct PendingReliable {
    packet: Packet,
    first_sent_at: Instant,
    sent_at: Instant,
    retry_count: u8,
}

/// Smoothed round-trip estimator (EWMA, Karn-sampled).
#[derive(Debug)]
struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }

    fn observe(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if sample > srtt { sample - srtt } else { srtt - sample };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    fn smoothed(&self) -> Option<Duration> {
        self.srtt
    }

    /// Base retransmit timeout; retries double it up to the cap.
    fn rto(&self, min: Duration, max: Duration) -> Duration {
        match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(min, max),
            None => min,
        }
    }
}

/// Acknowledgment bookkeeping, guarded by one lock.
struct AckState {
    pending_reliable: HashMap<u32, PendingReliable>,
    received_order: VecDeque<u32>,
    received_set: HashSet<u32>,
    pending_acks: Vec<u32>,
}

impl AckState {
    fn new() -> Self {
        Self {
            pending_reliable: HashMap::new(),
            received_order: VecDeque::new(),
            received_set: HashSet::new(),
            pending_acks: Vec::new(),
        }
    }

    /// Record a sequence; false if it was already seen. Oldest entries
    /// are evicted once the window is full.
    fn observe_sequence(&mut self, sequence: u32) -> bool {
        if !self.received_set.insert(sequence) {
            return false;
        }
        self.received_order.push_back(sequence);
        while self.received_order.len() > RECEIVED_WINDOW {
            if let Some(evicted) = self.received_order.pop_front() {
                self.received_set.remove(&evicted);
            }
        }
        true
    }

    fn take_acks(&mut self, max: usize) -> Vec<u32> {
        let n = self.pending_acks.len().min(max);
        self.pending_acks.drain(..n).collect()
    }
}

/// The reliable/sequencing layer over one peer.
pub struct Circuit {
    transport: Arc<UdpTransport>,
    peer: SocketAddr,
    config: CircuitConfig,
    next_sequence: AtomicU32,
    active: Arc<AtomicBool>,
    acks: Arc<Mutex<AckState>>,
    rtt: Arc<Mutex<RttEstimator>>,
    event_tx: mpsc::UnboundedSender<CircuitEvent>,
}

impl Circuit {
    pub fn new(
        transport: Arc<UdpTransport>,
        peer: SocketAddr,
        config: CircuitConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CircuitEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let circuit = Arc::new(Self {
            transport,
            peer,
            config,
            next_sequence: AtomicU32::new(1),
            active: Arc::new(AtomicBool::new(true)),
            acks: Arc::new(Mutex::new(AckState::new())),
            rtt: Arc::new(Mutex::new(RttEstimator::new())),
            event_tx,
        });
        (circuit, event_rx)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Smoothed round-trip time, if any sample has been taken.
    pub async fn smoothed_rtt(&self) -> Option<Duration> {
        self.rtt.lock().await.smoothed()
    }

    /// Feed an out-of-band latency sample (ping checks).
    pub async fn observe_rtt(&self, sample: Duration) {
        self.rtt.lock().await.observe(sample);
    }

    /// Number of reliable packets still awaiting acknowledgment.
    pub async fn pending_reliable_count(&self) -> usize {
        self.acks.lock().await.pending_reliable.len()
    }

    /// Stop the circuit: outstanding reliable state is dropped and no
    /// further sends are accepted.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let mut acks = self.acks.lock().await;
        acks.pending_reliable.clear();
        acks.pending_acks.clear();
    }

    /// Send a message. Reliability, flags, and ack piggy-backing are
    /// derived from the message type; returns the assigned sequence.
    pub async fn send(&self, message: &Message) -> NetworkResult<u32> {
        if !self.is_active() {
            return Err(NetworkError::CircuitInactive);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let message_type = message.message_type();
        let body = message.encode_body();

        let mut flags = PacketFlags::empty();
        if message_type.is_reliable() {
            flags |= PacketFlags::RELIABLE | PacketFlags::ACK_NEEDED;
        }
        if zerocode::should_encode(&body) {
            flags |= PacketFlags::ZEROCODED;
        }

        let mut packet = Packet::new(flags, sequence, message_type.id(), body);
        {
            let mut acks = self.acks.lock().await;
            packet.acks = acks.take_acks(MAX_PIGGYBACK);
            if message_type.is_reliable() {
                // Recorded before the datagram leaves, so an instant ack
                // can never race an absent entry.
                let now = Instant::now();
                acks.pending_reliable.insert(
                    sequence,
                    PendingReliable {
                        packet: packet.clone(),
                        first_sent_at: now,
                        sent_at: now,
                        retry_count: 0,
                    },
                );
            }
        }

        let wire = packet.serialize()?;
        match self.transport.send_datagram(wire, self.peer).await {
            Ok(()) => {
                trace!(sequence, ?message_type, "sent");
                Ok(sequence)
            }
            Err(err) => {
                // Transmit errors are logged and dropped; the retry sweep
                // picks reliable packets back up.
                warn!(sequence, "transmit error: {}", err);
                Ok(sequence)
            }
        }
    }

    /// Process one inbound packet. Duplicates are dropped here; acks are
    /// consumed here; everything else is forwarded as an event.
    pub async fn handle_inbound(&self, packet: Packet) {
        if !self.is_active() {
            return;
        }

        let acked = {
            let mut acks = self.acks.lock().await;

            if !acks.observe_sequence(packet.sequence) {
                trace!(sequence = packet.sequence, "duplicate dropped");
                return;
            }

            if packet.wants_ack() {
                acks.pending_acks.push(packet.sequence);
            }

            let mut acked: Vec<u32> = packet.acks.clone();
            if packet.message_type == MessageType::PacketAck.id() {
                if let Ok(Message::PacketAck { ids }) = Message::decode(packet.message_type, &packet.body)
                {
                    acked.extend(ids);
                }
            }

            let mut samples = Vec::new();
            for sequence in &acked {
                if let Some(pending) = acks.pending_reliable.remove(sequence) {
                    if pending.retry_count == 0 {
                        samples.push(pending.sent_at.elapsed());
                    }
                }
            }
            drop(acks);

            if !samples.is_empty() {
                let mut rtt = self.rtt.lock().await;
                for sample in samples {
                    rtt.observe(sample);
                }
            }
            acked
        };

        if !acked.is_empty() {
            trace!(count = acked.len(), "acknowledged");
        }

        // Dedicated ack packets are consumed by this layer.
        if packet.message_type == MessageType::PacketAck.id() {
            self.maybe_flush_acks().await;
            return;
        }

        let _ = self.event_tx.send(CircuitEvent::Inbound(packet));
        self.maybe_flush_acks().await;
    }

    /// Flush a dedicated `packetAck` when the batch has filled.
    async fn maybe_flush_acks(&self) {
        let should_flush = { self.acks.lock().await.pending_acks.len() >= ACK_BATCH };
        if should_flush {
            self.flush_acks().await;
        }
    }

    /// Send any batched acknowledgments as a dedicated `packetAck`.
    pub async fn flush_acks(&self) {
        let ids = {
            let mut acks = self.acks.lock().await;
            acks.take_acks(MAX_PIGGYBACK)
        };
        if ids.is_empty() {
            return;
        }

        let message = Message::PacketAck { ids };
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let packet = Packet::new(
            PacketFlags::empty(),
            sequence,
            MessageType::PacketAck.id(),
            message.encode_body(),
        );
        if let Ok(wire) = packet.serialize() {
            if let Err(err) = self.transport.send_datagram(wire, self.peer).await {
                debug!("ack flush failed: {}", err);
            }
        }
    }

    /// One pass of the retransmission sweep: re-send overdue reliable
    /// packets with `RESENT` set, fail those past the retry cap or the
    /// hard deadline, and flush batched acks.
    pub async fn sweep(&self) {
        if !self.is_active() {
            return;
        }

        let rto = {
            let rtt = self.rtt.lock().await;
            rtt.rto(self.config.min_rto, self.config.max_rto)
        };

        let now = Instant::now();
        let mut retransmits = Vec::new();
        let mut failures = Vec::new();
        {
            let mut acks = self.acks.lock().await;
            let mut expired = Vec::new();
            for (sequence, pending) in acks.pending_reliable.iter_mut() {
                // Backoff doubles per retry, capped at the configured max.
                let timeout = (rto * (1 << pending.retry_count.min(3)) as u32).min(self.config.max_rto);
                if now.duration_since(pending.sent_at) < timeout {
                    continue;
                }

                let past_deadline =
                    now.duration_since(pending.first_sent_at) >= self.config.reliable_timeout;
                if pending.retry_count >= self.config.retry_cap || past_deadline {
                    expired.push(*sequence);
                    continue;
                }

                pending.retry_count += 1;
                pending.sent_at = now;
                let mut packet = pending.packet.clone();
                packet.flags |= PacketFlags::RESENT;
                retransmits.push(packet);
            }

            for sequence in expired {
                if let Some(pending) = acks.pending_reliable.remove(&sequence) {
                    failures.push((sequence, pending.packet.message_type));
                }
            }
        }

        for packet in retransmits {
            debug!(sequence = packet.sequence, "retransmitting");
            if let Ok(wire) = packet.serialize() {
                if let Err(err) = self.transport.send_datagram(wire, self.peer).await {
                    warn!(sequence = packet.sequence, "retransmit error: {}", err);
                }
            }
        }

        for (sequence, message_type) in failures {
            warn!(sequence, message_type, "reliable delivery failed");
            let _ = self.event_tx.send(CircuitEvent::ReliableDeliveryFailed {
                sequence,
                message_type,
            });
        }

        self.flush_acks().await;
    }

    /// Spawn the periodic sweep task (once per second). The task exits
    /// when the circuit is shut down.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let circuit = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !circuit.is_active() {
                    break;
                }
                circuit.sweep().await;
            }
        });
    }
}
