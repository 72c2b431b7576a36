//! Client facade: one circuit, one session, one world.
//!
//! Wires the transport, circuit, handshake, router, and sim thread
//! together, and exposes the pull APIs (`statistics`, `health`) and
//! push streams (`subscribe`) the embedding layer consumes.

use crate::config::RuntimeConfig;
use crate::networking::circuit::{Circuit, CircuitEvent};
use crate::networking::handshake::{Handshake, HandshakeState};
use crate::networking::messages::{ChatType, Message, MessageType};
use crate::networking::router::{MessageHandler, MessageRouter, RouterStats};
use crate::networking::transport::{TransportConfig, UdpTransport};
use crate::networking::{NetworkError, NetworkResult};
use crate::recovery::{ErrorComponent, ErrorReport, ErrorSeverity, HealthReport};
use crate::world::avatar::InputEvent;
use crate::world::render::RenderSink;
use crate::world::sim::{self, SimCommand, SimHandle, SimStats, WorldEvent};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events surfaced to the embedding layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(HandshakeState),
    World(WorldEvent),
    Error {
        component: ErrorComponent,
        severity: ErrorSeverity,
        detail: String,
    },
}

/// Combined pull-style statistics.
#[derive(Debug, Clone)]
pub struct ClientStatistics {
    pub router: RouterStats,
    pub sim: SimStats,
    pub smoothed_rtt: Option<Duration>,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
}

/// Forwards handshake-phase messages into the state machine.
struct HandshakeHandler {
    handshake: Arc<Handshake>,
}

#[async_trait]
impl MessageHandler for HandshakeHandler {
    fn name(&self) -> &str {
        "handshake"
    }

    fn wants(&self, message_type: MessageType) -> bool {
        matches!(
            message_type,
            MessageType::RegionHandshake | MessageType::AgentMovementComplete
        )
    }

    async fn handle(&self, message: &Message) -> NetworkResult<()> {
        self.handshake.handle_message(message).await
    }
}

/// Posts world-bound messages onto the sim thread.
struct WorldHandler {
    sim: crossbeam_channel::Sender<SimCommand>,
}

#[async_trait]
impl MessageHandler for WorldHandler {
    fn name(&self) -> &str {
        "world"
    }

    fn wants(&self, message_type: MessageType) -> bool {
        use MessageType::*;
        matches!(
            message_type,
            ObjectUpdate
                | ObjectUpdateCompressed
                | ObjectUpdateCached
                | KillObject
                | ChatFromSimulator
                | InstantMessage
                | AgentUpdate
                | TeleportLocal
                | TeleportFinish
                | TeleportFailed
                | StartPingCheck
                | EnableSimulator
                | DisableSimulator
                | SimulatorViewerTimeMessage
                | CloseCircuit
        )
    }

    async fn handle(&self, message: &Message) -> NetworkResult<()> {
        let command = match message {
            Message::CloseCircuit => SimCommand::ConnectionLost {
                reason: "close circuit received".to_string(),
            },
            other => SimCommand::Inbound(other.clone()),
        };
        self.sim
            .send(command)
            .map_err(|_| NetworkError::Transport {
                reason: "sim thread gone".to_string(),
            })
    }
}

/// Matches ping responses to their send times and feeds the RTT
/// estimator.
struct PingHandler {
    circuit: Arc<Circuit>,
    in_flight: Arc<std::sync::Mutex<std::collections::HashMap<u8, std::time::Instant>>>,
}

#[async_trait]
impl MessageHandler for PingHandler {
    fn name(&self) -> &str {
        "ping"
    }

    fn wants(&self, message_type: MessageType) -> bool {
        message_type == MessageType::CompletePingCheck
    }

    async fn handle(&self, message: &Message) -> NetworkResult<()> {
        if let Message::CompletePingCheck { ping_id } = message {
            let sent_at = self.in_flight.lock().ok().and_then(|mut m| m.remove(ping_id));
            if let Some(sent_at) = sent_at {
                self.circuit.observe_rtt(sent_at.elapsed()).await;
            }
        }
        Ok(())
    }
}

pub struct Client {
    config: RuntimeConfig,
    transport: Arc<UdpTransport>,
    circuit: Arc<Circuit>,
    handshake: Arc<Handshake>,
    router: Arc<MessageRouter>,
    sim: Option<SimHandle>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl Client {
    /// Bind a socket, spawn the sim thread, and run the handshake
    /// against `peer` to completion of the first send. The returned
    /// client is live; observe `subscribe()` for `Complete`.
    pub async fn connect(
        peer: SocketAddr,
        config: RuntimeConfig,
        sink: Box<dyn RenderSink>,
    ) -> NetworkResult<Self> {
        let transport = Arc::new(UdpTransport::bind(TransportConfig::default()).await?);
        let (events_tx, _) = broadcast::channel(256);

        let (circuit, circuit_events) =
            Circuit::new(Arc::clone(&transport), peer, config.circuit.clone());
        circuit.spawn_sweeper();

        let (handshake, handshake_states) =
            Handshake::new(Arc::clone(&circuit), config.handshake_timeout);

        let router = MessageRouter::new();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (world_events_tx, world_events_rx) = broadcast::channel(256);
        let sim = sim::spawn(
            config.clone(),
            sink,
            outbound_tx,
            world_events_tx.clone(),
        );

        router
            .register(Arc::new(HandshakeHandler {
                handshake: Arc::clone(&handshake),
            }))
            .await;
        let sim_sender = sim.sender();
        router
            .register(Arc::new(WorldHandler { sim: sim.sender() }))
            .await;
        let ping_in_flight = Arc::new(std::sync::Mutex::new(std::collections::HashMap::new()));
        router
            .register(Arc::new(PingHandler {
                circuit: Arc::clone(&circuit),
                in_flight: Arc::clone(&ping_in_flight),
            }))
            .await;

        let client = Self {
            config,
            transport,
            circuit,
            handshake,
            router,
            sim: Some(sim),
            events_tx,
        };

        client.spawn_receive_pump();
        client.spawn_circuit_event_pump(circuit_events);
        client.spawn_outbound_pump(outbound_rx);
        client.spawn_handshake_observer(handshake_states);
        client.spawn_world_event_pump(world_events_rx);
        client.spawn_ping_loop(ping_in_flight, sim_sender);

        client.transport.set_send_enabled(true);
        client.handshake.start().await?;
        info!(%peer, "client connecting");
        Ok(client)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handshake.is_complete()
    }

    /// Pull-style statistics for the UI.
    pub async fn statistics(&self) -> ClientStatistics {
        let transport_stats = self.transport.stats();
        ClientStatistics {
            router: self.router.statistics().await,
            sim: self
                .sim
                .as_ref()
                .map(|s| s.statistics())
                .unwrap_or_default(),
            smoothed_rtt: self.circuit.smoothed_rtt().await,
            datagrams_sent: transport_stats
                .datagrams_sent
                .load(std::sync::atomic::Ordering::Relaxed),
            datagrams_received: transport_stats
                .datagrams_received
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> Option<HealthReport> {
        self.sim.as_ref().and_then(|s| s.statistics().health)
    }

    /// Forward an input event to the sim thread.
    pub fn input(&self, event: InputEvent) {
        if let Some(sim) = &self.sim {
            sim.post(SimCommand::Input(event));
        }
    }

    /// Say something on local chat.
    pub fn chat(&self, text: &str, chat_type: ChatType, channel: i32) {
        if let Some(sim) = &self.sim {
            sim.post(SimCommand::SendChat {
                text: text.to_string(),
                chat_type,
                channel,
            });
        }
    }

    pub fn instant_message(&self, im_session_id: Uuid, to_agent_id: Uuid, text: &str) {
        if let Some(sim) = &self.sim {
            sim.post(SimCommand::SendInstantMessage {
                im_session_id,
                to_agent_id,
                text: text.to_string(),
            });
        }
    }

    /// Request a teleport within or between regions.
    pub async fn teleport(&self, region_handle: u64, position: glam::Vec3, look_at: glam::Vec3) -> NetworkResult<()> {
        let identity = self.handshake.identity().await;
        self.circuit
            .send(&Message::TeleportLocationRequest {
                agent_id: identity.agent_id,
                session_id: identity.session_id,
                region_handle,
                position,
                look_at,
            })
            .await?;
        Ok(())
    }

    /// Request a teleport to a saved landmark.
    pub async fn teleport_to_landmark(&self, landmark_id: Uuid) -> NetworkResult<()> {
        let identity = self.handshake.identity().await;
        self.circuit
            .send(&Message::TeleportLandmarkRequest {
                agent_id: identity.agent_id,
                session_id: identity.session_id,
                landmark_id,
            })
            .await?;
        Ok(())
    }

    /// Disconnect: close the circuit, gate outbound traffic, and reset
    /// the handshake. No datagram leaves until the next connect.
    pub async fn disconnect(&mut self) {
        info!("disconnecting");
        let _ = self.circuit.send(&Message::CloseCircuit).await;
        self.circuit.shutdown().await;
        self.transport.set_send_enabled(false);
        self.router.set_session_live(false);
        if let Some(sim) = &self.sim {
            sim.post(SimCommand::ConnectionLost {
                reason: "disconnect requested".to_string(),
            });
        }
        self.handshake.reset().await;
    }

    pub fn shutdown(mut self) {
        if let Some(sim) = self.sim.take() {
            sim.shutdown();
        }
    }

    fn spawn_receive_pump(&self) {
        let mut rx = self.transport.spawn_receive_loop();
        let circuit = Arc::clone(&self.circuit);
        tokio::spawn(async move {
            while let Some((packet, peer)) = rx.recv().await {
                if peer != circuit.peer() {
                    debug!(%peer, "datagram from unexpected peer dropped");
                    continue;
                }
                circuit.handle_inbound(packet).await;
            }
        });
    }

    fn spawn_circuit_event_pump(&self, mut events: mpsc::UnboundedReceiver<CircuitEvent>) {
        let router = Arc::clone(&self.router);
        let events_tx = self.events_tx.clone();
        let sim = self.sim.as_ref().map(|s| s.sender());
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CircuitEvent::Inbound(packet) => router.route(packet).await,
                    CircuitEvent::ReliableDeliveryFailed {
                        sequence,
                        message_type,
                    } => {
                        warn!(sequence, message_type, "reliable delivery failed");
                        let report = ErrorReport::new(
                            ErrorComponent::Network,
                            ErrorSeverity::Medium,
                            format!("reliable delivery failed for seq {sequence}"),
                        );
                        let _ = events_tx.send(ClientEvent::Error {
                            component: report.component,
                            severity: report.severity,
                            detail: report.detail.clone(),
                        });
                        if let Some(sim) = &sim {
                            let _ = sim.send(SimCommand::ReportError(report));
                        }
                    }
                }
            }
        });
    }

    fn spawn_outbound_pump(&self, mut outbound: mpsc::UnboundedReceiver<Message>) {
        let circuit = Arc::clone(&self.circuit);
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(err) = circuit.send(&message).await {
                    debug!("outbound send failed: {}", err);
                }
            }
        });
    }

    fn spawn_handshake_observer(&self, mut states: tokio::sync::watch::Receiver<HandshakeState>) {
        let router = Arc::clone(&self.router);
        let handshake = Arc::clone(&self.handshake);
        let events_tx = self.events_tx.clone();
        let sim = self.sim.as_ref().map(|s| s.sender());
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let _ = events_tx.send(ClientEvent::StateChanged(state.clone()));
                match state {
                    HandshakeState::Complete => {
                        router.set_session_live(true);
                        let identity = handshake.identity().await;
                        if let (Some(sim), Some(completion)) = (&sim, handshake.completion().await)
                        {
                            let _ = sim.send(SimCommand::SessionStarted {
                                identity,
                                completion,
                                region: handshake.region_info().await,
                            });
                        }
                    }
                    HandshakeState::Failed(reason) => {
                        router.set_session_live(false);
                        let _ = events_tx.send(ClientEvent::Error {
                            component: ErrorComponent::Network,
                            severity: ErrorSeverity::High,
                            detail: format!("handshake failed: {reason}"),
                        });
                        if let Some(sim) = &sim {
                            let _ = sim.send(SimCommand::ReportError(ErrorReport::new(
                                ErrorComponent::Network,
                                ErrorSeverity::High,
                                format!("handshake failed: {reason}"),
                            )));
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    /// Periodic latency probe: `startPingCheck` out, answered by
    /// `completePingCheck` through [`PingHandler`]. The smoothed figure
    /// is relayed to the sim thread for health scoring.
    fn spawn_ping_loop(
        &self,
        in_flight: Arc<std::sync::Mutex<std::collections::HashMap<u8, std::time::Instant>>>,
        sim: crossbeam_channel::Sender<SimCommand>,
    ) {
        let circuit = Arc::clone(&self.circuit);
        let handshake = Arc::clone(&self.handshake);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ping_id: u8 = 0;
            loop {
                interval.tick().await;
                if !circuit.is_active() {
                    break;
                }
                if let Some(rtt) = circuit.smoothed_rtt().await {
                    let _ = sim.send(SimCommand::ObservedRtt(rtt));
                }
                if !handshake.is_complete() {
                    continue;
                }
                ping_id = ping_id.wrapping_add(1);
                if let Ok(mut map) = in_flight.lock() {
                    map.insert(ping_id, std::time::Instant::now());
                    // Responses more than a few probes old are dead.
                    if map.len() > 8 {
                        if let Some(oldest) = map.keys().next().copied() {
                            map.remove(&oldest);
                        }
                    }
                }
                let _ = circuit
                    .send(&Message::StartPingCheck {
                        ping_id,
                        oldest_unacked: 0,
                    })
                    .await;
            }
        });
    }

    fn spawn_world_event_pump(&self, mut events: broadcast::Receiver<WorldEvent>) {
        let events_tx = self.events_tx.clone();
        let handshake = Arc::clone(&self.handshake);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WorldEvent::ResyncRequested) => {
                        let _ = events_tx.send(ClientEvent::World(WorldEvent::ResyncRequested));
                        // The world has been cleared; rebuild the session
                        // on the same circuit.
                        debug!("resync requested; restarting handshake");
                        handshake.reset().await;
                        if let Err(err) = handshake.start().await {
                            warn!("handshake restart failed: {}", err);
                        }
                    }
                    Ok(event) => {
                        let _ = events_tx.send(ClientEvent::World(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "world event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}
