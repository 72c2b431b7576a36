//! Priority-scheduled message router.
//!
//! Decoded packets are assigned to a priority band by message type and
//! drained by one worker per band. Handlers register with a name, a
//! type predicate, and a band; a packet that matches no handler falls
//! through to a built-in default that publishes a high-level domain
//! event for subscribers.

use crate::networking::codec::Packet;
use crate::networking::messages::{Message, MessageType, ObjectUpdateData};
use crate::networking::NetworkResult;
use async_trait::async_trait;
use glam::Vec3;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Scheduling class. Lower value drains first only in the sense that
/// each band has its own worker; bands do not starve one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PriorityBand {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl PriorityBand {
    pub const ALL: [PriorityBand; 4] = [
        PriorityBand::Critical,
        PriorityBand::High,
        PriorityBand::Normal,
        PriorityBand::Low,
    ];

    /// Band assignment: handshake/teleport/circuit traffic is Critical,
    /// object and agent updates High, chat/IM/teleport requests Normal,
    /// pings/time/background Low.
    pub fn for_type(message_type: MessageType) -> Self {
        use MessageType::*;
        match message_type {
            OpenCircuit | CloseCircuit | UseCircuitCode | CompleteAgentMovement
            | RegionHandshake | RegionHandshakeReply | AgentMovementComplete | TeleportLocal
            | TeleportFinish | TeleportFailed | EnableSimulator | DisableSimulator => {
                PriorityBand::Critical
            }
            ObjectUpdate | ObjectUpdateCompressed | ObjectUpdateCached | KillObject
            | AgentUpdate | AgentAnimation => PriorityBand::High,
            ChatFromSimulator | ChatFromViewer | InstantMessage | TeleportLocationRequest
            | TeleportLandmarkRequest | AgentRequestSit => PriorityBand::Normal,
            Test | PacketAck | SimulatorViewerTimeMessage | StartPingCheck | CompletePingCheck
            | PingCheck => PriorityBand::Low,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A registered message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name for logging and statistics.
    fn name(&self) -> &str;

    /// Predicate over message type.
    fn wants(&self, message_type: MessageType) -> bool;

    async fn handle(&self, message: &Message) -> NetworkResult<()>;
}

/// High-level event published when no registered handler claims a
/// message, and for the handful of protocol-level notifications every
/// subscriber cares about.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    ObjectUpdate {
        local_id: u32,
        position: Option<Vec3>,
    },
    Chat {
        from_name: String,
        message: String,
    },
    RegionHandshake {
        sim_name: String,
        region_handle: u64,
    },
    AgentMovementComplete {
        position: Vec3,
        region_handle: u64,
    },
    PingResponse {
        ping_id: u8,
    },
}

/// Router statistics. Reset on a fixed period.
#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    pub total_processed: u64,
    pub handler_errors: u64,
    pub unknown_types: u64,
    pub filtered: u64,
    pub dropped_pre_session: u64,
    pub per_type: HashMap<u32, u64>,
    pub avg_processing: Duration,
}

impl RouterStats {
    fn record(&mut self, message_type: u32, elapsed: Duration) {
        self.total_processed += 1;
        *self.per_type.entry(message_type).or_insert(0) += 1;
        // Rolling average over everything since the last reset.
        let n = self.total_processed as u32;
        self.avg_processing = (self.avg_processing * (n - 1) + elapsed) / n;
    }
}

const STATS_RESET_INTERVAL: Duration = Duration::from_secs(300);

struct BandQueue {
    tx: mpsc::UnboundedSender<Packet>,
    depth: Arc<AtomicUsize>,
}

/// The router. One instance per circuit.
pub struct MessageRouter {
    bands: Vec<BandQueue>,
    handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
    stats: Arc<Mutex<(RouterStats, Instant)>>,
    /// Message types currently disabled. Empty in debug builds; noisy
    /// diagnostics are off in release.
    disabled_types: Arc<RwLock<std::collections::HashSet<u32>>>,
    /// Until the handshake completes only handshake-adjacent traffic is
    /// admitted.
    session_live: Arc<AtomicBool>,
    debug_trace: Arc<AtomicBool>,
    events_tx: broadcast::Sender<DomainEvent>,
}

impl MessageRouter {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>> = Arc::new(RwLock::new(Vec::new()));
        let stats = Arc::new(Mutex::new((RouterStats::default(), Instant::now())));
        let session_live = Arc::new(AtomicBool::new(false));
        let debug_trace = Arc::new(AtomicBool::new(cfg!(debug_assertions)));

        let mut disabled = std::collections::HashSet::new();
        if !cfg!(debug_assertions) {
            disabled.insert(MessageType::Test.id());
        }
        let disabled_types = Arc::new(RwLock::new(disabled));

        let mut bands = Vec::with_capacity(PriorityBand::ALL.len());
        for band in PriorityBand::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            let depth = Arc::new(AtomicUsize::new(0));
            bands.push(BandQueue {
                tx,
                depth: Arc::clone(&depth),
            });
            Self::spawn_worker(
                band,
                rx,
                depth,
                Arc::clone(&handlers),
                Arc::clone(&stats),
                Arc::clone(&debug_trace),
                events_tx.clone(),
            );
        }

        Arc::new(Self {
            bands,
            handlers,
            stats,
            disabled_types,
            session_live,
            debug_trace,
            events_tx,
        })
    }

    /// Register a handler. Handlers run in registration order.
    pub async fn register(&self, handler: Arc<dyn MessageHandler>) {
        debug!("registering handler {}", handler.name());
        self.handlers.write().await.push(handler);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events_tx.subscribe()
    }

    /// Flip the session gate; called by the handshake observer.
    pub fn set_session_live(&self, live: bool) {
        self.session_live.store(live, Ordering::SeqCst);
    }

    pub fn set_debug_trace(&self, enabled: bool) {
        self.debug_trace.store(enabled, Ordering::SeqCst);
    }

    pub async fn set_type_enabled(&self, message_type: MessageType, enabled: bool) {
        let mut disabled = self.disabled_types.write().await;
        if enabled {
            disabled.remove(&message_type.id());
        } else {
            disabled.insert(message_type.id());
        }
    }

    pub async fn statistics(&self) -> RouterStats {
        self.stats.lock().await.0.clone()
    }

    pub fn queue_depth(&self, band: PriorityBand) -> usize {
        self.bands[band.index()].depth.load(Ordering::Relaxed)
    }

    /// Admit one packet: filter, gate, and enqueue on its band.
    pub async fn route(&self, packet: Packet) {
        let Some(message_type) = MessageType::from_u32(packet.message_type) else {
            let mut stats = self.stats.lock().await;
            stats.0.unknown_types += 1;
            warn!(message_type = packet.message_type, "unknown message type");
            return;
        };

        if self.disabled_types.read().await.contains(&packet.message_type) {
            self.stats.lock().await.0.filtered += 1;
            return;
        }

        // Pre-session, only the traffic needed to become live may pass.
        let band = PriorityBand::for_type(message_type);
        if !self.session_live.load(Ordering::SeqCst)
            && band != PriorityBand::Critical
            && band != PriorityBand::Low
        {
            self.stats.lock().await.0.dropped_pre_session += 1;
            trace!(?message_type, "dropped before session is live");
            return;
        }

        let queue = &self.bands[band.index()];
        queue.depth.fetch_add(1, Ordering::Relaxed);
        if queue.tx.send(packet).is_err() {
            queue.depth.fetch_sub(1, Ordering::Relaxed);
            warn!("band {:?} worker is gone", band);
        }
    }

    fn spawn_worker(
        band: PriorityBand,
        mut rx: mpsc::UnboundedReceiver<Packet>,
        depth: Arc<AtomicUsize>,
        handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
        stats: Arc<Mutex<(RouterStats, Instant)>>,
        debug_trace: Arc<AtomicBool>,
        events_tx: broadcast::Sender<DomainEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                depth.fetch_sub(1, Ordering::Relaxed);
                let started = Instant::now();

                let message = match Message::decode(packet.message_type, &packet.body) {
                    Ok(message) => message,
                    Err(err) => {
                        let mut guard = stats.lock().await;
                        guard.0.handler_errors += 1;
                        debug!(?band, "body decode failed: {}", err);
                        continue;
                    }
                };
                let message_type = message.message_type();

                if debug_trace.load(Ordering::SeqCst) {
                    trace!(?band, ?message_type, seq = packet.sequence, "dispatch");
                }

                let mut matched = false;
                let snapshot: Vec<Arc<dyn MessageHandler>> =
                    handlers.read().await.iter().cloned().collect();
                for handler in snapshot {
                    if !handler.wants(message_type) {
                        continue;
                    }
                    matched = true;
                    if let Err(err) = handler.handle(&message).await {
                        // Sibling handlers still run.
                        warn!(handler = handler.name(), "handler error: {}", err);
                        stats.lock().await.0.handler_errors += 1;
                    }
                }

                if !matched {
                    Self::emit_default(&events_tx, &message);
                }

                let mut guard = stats.lock().await;
                guard.0.record(packet.message_type, started.elapsed());
                if guard.1.elapsed() >= STATS_RESET_INTERVAL {
                    guard.0 = RouterStats::default();
                    guard.1 = Instant::now();
                }
            }
        });
    }

    fn emit_default(events_tx: &broadcast::Sender<DomainEvent>, message: &Message) {
        let event = match message {
            Message::ObjectUpdate { data, .. } => Some(DomainEvent::ObjectUpdate {
                local_id: data.local_id(),
                position: match data {
                    ObjectUpdateData::Full(d) => Some(d.position),
                    ObjectUpdateData::Terse(d) => Some(d.position),
                    _ => None,
                },
            }),
            Message::ChatFromSimulator {
                from_name, message, ..
            } => Some(DomainEvent::Chat {
                from_name: from_name.clone(),
                message: message.clone(),
            }),
            Message::RegionHandshake {
                sim_name,
                region_handle,
                ..
            } => Some(DomainEvent::RegionHandshake {
                sim_name: sim_name.clone(),
                region_handle: *region_handle,
            }),
            Message::AgentMovementComplete {
                position,
                region_handle,
                ..
            } => Some(DomainEvent::AgentMovementComplete {
                position: *position,
                region_handle: *region_handle,
            }),
            Message::CompletePingCheck { ping_id } => Some(DomainEvent::PingResponse {
                ping_id: *ping_id,
            }),
            _ => None,
        };

        if let Some(event) = event {
            let _ = events_tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::codec::PacketFlags;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        name: String,
        wanted: MessageType,
        hits: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn wants(&self, message_type: MessageType) -> bool {
            message_type == self.wanted
        }

        async fn handle(&self, _message: &Message) -> NetworkResult<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::networking::NetworkError::Transport {
                    reason: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn packet_for(message: &Message, sequence: u32) -> Packet {
        Packet::new(
            PacketFlags::empty(),
            sequence,
            message.message_type().id(),
            message.encode_body(),
        )
    }

    async fn drain(router: &MessageRouter) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let _ = router;
    }

    #[test]
    fn test_band_assignment() {
        assert_eq!(
            PriorityBand::for_type(MessageType::UseCircuitCode),
            PriorityBand::Critical
        );
        assert_eq!(
            PriorityBand::for_type(MessageType::ObjectUpdate),
            PriorityBand::High
        );
        assert_eq!(
            PriorityBand::for_type(MessageType::ChatFromSimulator),
            PriorityBand::Normal
        );
        assert_eq!(
            PriorityBand::for_type(MessageType::StartPingCheck),
            PriorityBand::Low
        );
    }

    #[tokio::test]
    async fn test_dispatch_and_stats() {
        let router = MessageRouter::new();
        router.set_session_live(true);
        let hits = Arc::new(AtomicU32::new(0));
        router
            .register(Arc::new(CountingHandler {
                name: "ping".to_string(),
                wanted: MessageType::PingCheck,
                hits: Arc::clone(&hits),
                fail: false,
            }))
            .await;

        router
            .route(packet_for(&Message::PingCheck { ping_id: 1 }, 1))
            .await;
        drain(&router).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = router.statistics().await;
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.per_type[&MessageType::PingCheck.id()], 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_siblings() {
        let router = MessageRouter::new();
        router.set_session_live(true);
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        router
            .register(Arc::new(CountingHandler {
                name: "fails".to_string(),
                wanted: MessageType::PingCheck,
                hits: Arc::clone(&first),
                fail: true,
            }))
            .await;
        router
            .register(Arc::new(CountingHandler {
                name: "succeeds".to_string(),
                wanted: MessageType::PingCheck,
                hits: Arc::clone(&second),
                fail: false,
            }))
            .await;

        router
            .route(packet_for(&Message::PingCheck { ping_id: 1 }, 1))
            .await;
        drain(&router).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(router.statistics().await.handler_errors, 1);
    }

    #[tokio::test]
    async fn test_unmatched_message_emits_domain_event() {
        let router = MessageRouter::new();
        router.set_session_live(true);
        let mut events = router.subscribe_events();

        router
            .route(packet_for(
                &Message::ChatFromSimulator {
                    from_name: "Bob".to_string(),
                    source_id: uuid::Uuid::new_v4(),
                    owner_id: uuid::Uuid::new_v4(),
                    source_type: crate::networking::messages::ChatSourceType::Agent,
                    chat_type: crate::networking::messages::ChatType::Say,
                    audible: true,
                    position: None,
                    message: "hello".to_string(),
                },
                1,
            ))
            .await;
        drain(&router).await;

        match events.try_recv() {
            Ok(DomainEvent::Chat { from_name, message }) => {
                assert_eq!(from_name, "Bob");
                assert_eq!(message, "hello");
            }
            other => panic!("expected chat event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pre_session_gating() {
        let router = MessageRouter::new();
        // Session not live: object updates are dropped, handshake passes.
        router
            .route(packet_for(
                &Message::KillObject { local_ids: vec![1] },
                1,
            ))
            .await;
        router
            .route(packet_for(
                &Message::RegionHandshake {
                    region_flags: 0,
                    sim_name: "r".to_string(),
                    water_height: 20.0,
                    region_handle: 1,
                },
                2,
            ))
            .await;
        drain(&router).await;

        let stats = router.statistics().await;
        assert_eq!(stats.dropped_pre_session, 1);
        assert_eq!(stats.total_processed, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_counted() {
        let router = MessageRouter::new();
        let packet = Packet::new(PacketFlags::empty(), 1, 999, bytes::Bytes::new());
        router.route(packet).await;
        assert_eq!(router.statistics().await.unknown_types, 1);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let router = MessageRouter::new();
        router.set_session_live(true);
        router.set_type_enabled(MessageType::PingCheck, false).await;
        router
            .route(packet_for(&Message::PingCheck { ping_id: 1 }, 1))
            .await;
        drain(&router).await;
        let stats = router.statistics().await;
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.total_processed, 0);
    }
}
