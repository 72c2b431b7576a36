//! The sim thread: single writer for the entity store.
//!
//! All world mutation funnels through a command queue drained here.
//! Each frame the loop applies commands, drains the update coalescer
//! under its budget, ticks the avatar and chat, runs the periodic
//! recovery sweeps, and only then flushes change notifications to the
//! render bridge, so observers see per-entity writes atomically.

use crate::config::RuntimeConfig;
use crate::networking::handshake::{MovementComplete, RegionInfo, SessionIdentity};
use crate::networking::messages::{AgentUpdateData, ChatType, Message, ObjectUpdateData};
use crate::recovery::{
    health_score, CleanupKind, CleanupOp, CleanupQueue, CleanupTarget, ConsistencyChecker,
    ErrorComponent, ErrorReport, ErrorSeverity, HealthBand, HealthInputs, HealthReport,
    MemoryLevel, MemoryMonitor, RecoveryEngine, RecoveryStrategy,
};
use crate::world::avatar::interpolation::{InterpolationBuffer, Sample};
use crate::world::avatar::{AvatarController, InputEvent, NearbyCollider};
use crate::world::chat::ChatSystem;
use crate::world::components::{Position, RegionBoundary, Rotation, Velocity, Visual, VisualKind};
use crate::world::lifecycle::{AssetRequest, IncomingUpdate, ObjectLifecycle};
use crate::world::render::{RenderBridge, RenderSink};
use crate::world::store::{EntityId, EntityStore};
use glam::Vec3;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work posted to the sim thread.
#[derive(Debug)]
pub enum SimCommand {
    /// A routed inbound protocol message.
    Inbound(Message),
    Input(InputEvent),
    SendChat {
        text: String,
        chat_type: ChatType,
        channel: i32,
    },
    SendInstantMessage {
        im_session_id: Uuid,
        to_agent_id: Uuid,
        text: String,
    },
    RequestSit {
        target: Uuid,
    },
    /// Handshake completed; adopt the session and spawn position.
    SessionStarted {
        identity: SessionIdentity,
        completion: MovementComplete,
        region: Option<RegionInfo>,
    },
    ConnectionLost {
        reason: String,
    },
    ReportError(ErrorReport),
    /// Smoothed round-trip figure from the circuit's estimator.
    ObservedRtt(Duration),
    ForceResync,
    Shutdown,
}

/// Notifications published to the client facade and UI.
#[derive(Debug, Clone)]
pub enum WorldEvent {
    SessionAdopted,
    TeleportCompleted(Vec3),
    HealthChanged(HealthBand),
    MemoryPressure(MemoryLevel),
    /// The world asks the networking side to reset and reconnect.
    ResyncRequested,
    DegradedMode(bool),
    AssetWanted(AssetRequest),
}

/// Pull-style statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub entity_count: usize,
    pub tracked_objects: usize,
    pub queued_updates: usize,
    pub cleanup_pending: usize,
    pub chat_history: usize,
    pub neighbor_regions: usize,
    /// Estimated simulator clock, microseconds since region start.
    pub region_time_usec: Option<u64>,
    pub health: Option<HealthReport>,
}

/// Remote agent bookkeeping: an interpolated entity per peer avatar.
struct RemoteAgent {
    entity: EntityId,
    buffer: InterpolationBuffer,
}

pub struct SimHandle {
    command_tx: crossbeam_channel::Sender<SimCommand>,
    stats: Arc<Mutex<SimStats>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SimHandle {
    pub fn post(&self, command: SimCommand) {
        let _ = self.command_tx.send(command);
    }

    /// A cloneable sender for handlers that post from other threads.
    pub fn sender(&self) -> crossbeam_channel::Sender<SimCommand> {
        self.command_tx.clone()
    }

    pub fn statistics(&self) -> SimStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(SimCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SimCommand::Shutdown);
    }
}

/// Spawn the sim thread.
///
/// `outbound` carries messages the world wants sent on the circuit;
/// `events` fans world notifications out to subscribers.
pub fn spawn(
    config: RuntimeConfig,
    sink: Box<dyn RenderSink>,
    outbound: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<WorldEvent>,
) -> SimHandle {
    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let stats = Arc::new(Mutex::new(SimStats::default()));
    let stats_for_thread = Arc::clone(&stats);

    let join = std::thread::Builder::new()
        .name("sim".to_string())
        .spawn(move || {
            let mut sim = Sim::new(config, sink, outbound, events, stats_for_thread);
            sim.run(command_rx);
        })
        .expect("spawn sim thread");

    SimHandle {
        command_tx,
        stats,
        join: Some(join),
    }
}

struct Sim {
    config: RuntimeConfig,
    store: EntityStore,
    lifecycle: ObjectLifecycle,
    bridge: RenderBridge,
    avatar: AvatarController,
    chat: ChatSystem,
    cleanup: CleanupQueue,
    checker: ConsistencyChecker,
    recovery: RecoveryEngine,
    memory: MemoryMonitor,

    identity: Option<SessionIdentity>,
    region_entity: Option<EntityId>,
    remote_agents: HashMap<Uuid, RemoteAgent>,
    degraded: bool,
    /// Movement state last announced via `agentAnimation`.
    announced_state: Option<crate::world::components::MovementState>,
    /// Simulator clock offset: (usec since region start, when heard).
    region_time: Option<(u64, Instant)>,
    /// Region handles of announced neighbor simulators.
    neighbors: std::collections::HashSet<u64>,
    /// Latest smoothed RTT reported by the networking side.
    observed_rtt: Option<Duration>,
    /// Consistency input for health, set by the last cross-pass.
    consistency_score: f32,
    /// Ticks completed since the last stats publication.
    ticks_in_window: u32,

    outbound: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<WorldEvent>,
    stats: Arc<Mutex<SimStats>>,

    started: Instant,
    last_cleanup_sweep: Instant,
    last_consistency: Instant,
    last_memory_probe: Instant,
    last_stats: Instant,
    last_health_band: Option<HealthBand>,
}

impl Sim {
    fn new(
        config: RuntimeConfig,
        sink: Box<dyn RenderSink>,
        outbound: mpsc::UnboundedSender<Message>,
        events: broadcast::Sender<WorldEvent>,
        stats: Arc<Mutex<SimStats>>,
    ) -> Self {
        let mut store = EntityStore::new();
        let avatar =
            AvatarController::spawn(&mut store, &config.display_name, config.avatar.clone());
        let now = Instant::now();

        Self {
            lifecycle: ObjectLifecycle::new(config.lifecycle.clone()),
            bridge: RenderBridge::new(sink),
            chat: ChatSystem::new(config.chat.clone()),
            cleanup: CleanupQueue::new(),
            checker: ConsistencyChecker::new(),
            recovery: RecoveryEngine::new(),
            memory: MemoryMonitor::new(config.memory_warn_bytes, config.memory_critical_bytes),
            identity: None,
            region_entity: None,
            remote_agents: HashMap::new(),
            degraded: false,
            announced_state: None,
            region_time: None,
            neighbors: std::collections::HashSet::new(),
            observed_rtt: None,
            consistency_score: 1.0,
            ticks_in_window: 0,
            store,
            avatar,
            outbound,
            events,
            stats,
            started: now,
            last_cleanup_sweep: now,
            last_consistency: now,
            last_memory_probe: now,
            last_stats: now,
            last_health_band: None,
            config,
        }
    }

    fn run(&mut self, commands: crossbeam_channel::Receiver<SimCommand>) {
        info!("sim thread running");
        let frame = self.config.lifecycle.frame_duration;
        let mut next_tick = Instant::now() + frame;

        loop {
            let now = Instant::now();
            let wait = next_tick.saturating_duration_since(now);
            match commands.recv_timeout(wait) {
                Ok(SimCommand::Shutdown) => break,
                Ok(command) => self.handle_command(command),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now >= next_tick {
                self.tick(now, frame.as_secs_f32());
                next_tick = now + frame;
            }
        }
        info!("sim thread stopped");
    }

    fn handle_command(&mut self, command: SimCommand) {
        match command {
            SimCommand::Inbound(message) => self.handle_inbound(message),
            SimCommand::Input(event) => self.avatar.handle_input(event),
            SimCommand::SendChat {
                text,
                chat_type,
                channel,
            } => {
                let Some(identity) = self.identity else {
                    return;
                };
                let display_name = self.config.display_name.clone();
                let message = self.chat.send_chat(
                    identity.agent_id,
                    identity.session_id,
                    &display_name,
                    &text,
                    chat_type,
                    channel,
                    self.avatar.position(),
                    Instant::now(),
                );
                let _ = self.outbound.send(message);
            }
            SimCommand::SendInstantMessage {
                im_session_id,
                to_agent_id,
                text,
            } => {
                let Some(identity) = self.identity else {
                    return;
                };
                let display_name = self.config.display_name.clone();
                let timestamp = self.started.elapsed().as_secs() as u32;
                let message = self.chat.send_instant_message(
                    identity.agent_id,
                    identity.session_id,
                    im_session_id,
                    to_agent_id,
                    &display_name,
                    &text,
                    timestamp,
                    Instant::now(),
                );
                let _ = self.outbound.send(message);
            }
            SimCommand::RequestSit { target } => {
                if let Some(identity) = self.identity {
                    self.avatar.sit_on(target);
                    let _ = self.outbound.send(Message::AgentRequestSit {
                        agent_id: identity.agent_id,
                        session_id: identity.session_id,
                        target_id: target,
                        offset: Vec3::ZERO,
                    });
                }
            }
            SimCommand::SessionStarted {
                identity,
                completion,
                region,
            } => self.adopt_session(identity, completion, region),
            SimCommand::ConnectionLost { reason } => self.on_connection_lost(&reason),
            SimCommand::ReportError(report) => self.apply_recovery(report),
            SimCommand::ObservedRtt(rtt) => self.observed_rtt = Some(rtt),
            SimCommand::ForceResync => self.full_resync(),
            SimCommand::Shutdown => unreachable!("handled by run loop"),
        }
    }

    fn handle_inbound(&mut self, message: Message) {
        let avatar_position = self.avatar.position();
        match message {
            Message::ObjectUpdate { data, .. } => {
                let update = match data {
                    ObjectUpdateData::Full(d) => IncomingUpdate::Full(d),
                    ObjectUpdateData::Terse(d) => IncomingUpdate::Terse(d),
                    ObjectUpdateData::Texture(d) => IncomingUpdate::Texture(d),
                    ObjectUpdateData::Properties(d) => IncomingUpdate::Properties(d),
                };
                self.lifecycle.enqueue(update, avatar_position);
            }
            Message::ObjectUpdateCompressed { data, .. } => {
                self.lifecycle
                    .enqueue(IncomingUpdate::Compressed(data), avatar_position);
            }
            Message::ObjectUpdateCached {
                local_id,
                mesh_ref,
                material_ref,
                update_flags,
            } => {
                self.lifecycle.enqueue(
                    IncomingUpdate::Cached {
                        local_id,
                        mesh_ref,
                        material_ref,
                        update_flags,
                    },
                    avatar_position,
                );
            }
            Message::KillObject { local_ids } => {
                for local_id in local_ids {
                    self.cleanup.enqueue(CleanupOp::new(
                        CleanupKind::Normal,
                        CleanupTarget::LocalId(local_id),
                        "kill message",
                    ));
                }
            }
            Message::ChatFromSimulator { .. } => {
                self.chat.handle_chat(
                    &mut self.store,
                    &mut self.bridge,
                    &message,
                    avatar_position,
                    Instant::now(),
                );
            }
            Message::InstantMessage { .. } => {
                self.chat.handle_instant_message(&message, Instant::now());
            }
            Message::AgentUpdate(update) => self.handle_agent_update(update),
            Message::TeleportLocal {
                position, look_at, ..
            } => {
                self.avatar.teleport_to(&mut self.store, position, look_at);
                let _ = self.events.send(WorldEvent::TeleportCompleted(position));
            }
            Message::TeleportFinish {
                position, look_at, ..
            } => {
                self.avatar.teleport_to(&mut self.store, position, look_at);
                let _ = self.events.send(WorldEvent::TeleportCompleted(position));
            }
            Message::TeleportFailed { reason, .. } => {
                warn!(%reason, "teleport failed");
                self.apply_recovery(ErrorReport::new(
                    ErrorComponent::Protocol,
                    ErrorSeverity::Medium,
                    format!("teleport failed: {reason}"),
                ));
            }
            Message::StartPingCheck { ping_id, .. } => {
                let _ = self.outbound.send(Message::CompletePingCheck { ping_id });
            }
            Message::EnableSimulator { region_handle, .. } => {
                debug!(region_handle, "neighbor simulator enabled");
                self.neighbors.insert(region_handle);
            }
            Message::DisableSimulator => {
                debug!("neighbor simulators disabled");
                self.neighbors.clear();
            }
            Message::SimulatorViewerTimeMessage {
                usec_since_start, ..
            } => {
                self.region_time = Some((usec_since_start, Instant::now()));
            }
            other => debug!(message_type = ?other.message_type(), "unrouted message in sim"),
        }
    }

    /// Remote agent state report, or an authoritative correction for the
    /// local avatar.
    fn handle_agent_update(&mut self, update: AgentUpdateData) {
        if let Some(identity) = self.identity {
            if update.agent_id == identity.agent_id {
                self.avatar.reconcile(update.position);
                return;
            }
        }

        let now = self.started.elapsed();
        let agent = self.remote_agents.entry(update.agent_id).or_insert_with(|| {
            let entity = self.store.create();
            self.store.set_position(entity, Position(update.position));
            self.store
                .set_rotation(entity, Rotation(update.body_rotation));
            self.store.set_visual(
                entity,
                Visual {
                    kind: VisualKind::Capsule,
                    ..Visual::default()
                },
            );
            debug!(agent = %update.agent_id, "remote agent appeared");
            RemoteAgent {
                entity,
                buffer: InterpolationBuffer::new(),
            }
        });
        agent.buffer.push(Sample {
            at: now,
            position: update.position,
            velocity: Vec3::ZERO,
            rotation: update.body_rotation,
        });
    }

    fn adopt_session(
        &mut self,
        identity: SessionIdentity,
        completion: MovementComplete,
        region: Option<RegionInfo>,
    ) {
        self.identity = Some(identity);
        self.avatar
            .teleport_to(&mut self.store, completion.position, completion.look_at);

        if let Some(region) = region {
            let entity = *self.region_entity.get_or_insert_with(|| self.store.create());
            self.store.set_region_boundary(
                entity,
                RegionBoundary {
                    region_handle: region.region_handle,
                    size: 256.0,
                    water_height: region.water_height,
                },
            );
        }
        info!(agent = %identity.agent_id, "session adopted by sim");
        let _ = self.events.send(WorldEvent::SessionAdopted);
    }

    fn on_connection_lost(&mut self, reason: &str) {
        warn!(%reason, "connection lost; cleaning circuit-owned state");
        self.identity = None;
        self.announced_state = None;
        self.region_time = None;
        self.observed_rtt = None;

        // Connection cleanup of every entity owned by the lost circuit,
        // drained immediately rather than amortized over frames.
        self.cleanup.enqueue_connection_loss(&self.lifecycle);
        self.cleanup.set_emergency(true);
        while !self.cleanup.is_empty() {
            if self.cleanup.process(&mut self.store, &mut self.lifecycle) == 0 {
                break;
            }
        }
        for (_, agent) in self.remote_agents.drain() {
            self.store.destroy(agent.entity);
        }

        // Recorded for the escalation history; the resync below is the
        // reconnect path itself.
        let _ = self.recovery.decide(ErrorReport::new(
            ErrorComponent::Network,
            ErrorSeverity::High,
            format!("connection lost: {reason}"),
        ));
        self.full_resync();
    }

    fn apply_recovery(&mut self, report: ErrorReport) {
        let component = report.component;
        let plan = self.recovery.decide(report);
        match plan.strategy {
            RecoveryStrategy::Immediate => {}
            RecoveryStrategy::ExponentialBackoff => {
                // The networking side honors the delay; the world only
                // records it.
                debug!(delay = ?plan.delay, "backoff requested");
            }
            RecoveryStrategy::FullResync => {
                self.full_resync();
                self.recovery
                    .report_outcome(component, RecoveryStrategy::FullResync, true);
            }
            RecoveryStrategy::GracefulDegradation => self.enter_degraded_mode(),
            RecoveryStrategy::UserIntervention => {
                warn!("recovery requires user intervention");
            }
        }
    }

    /// Clear the world and ask the networking side to rebuild the
    /// session.
    fn full_resync(&mut self) {
        info!("full resynchronization");
        self.chat.clear_bubbles(&mut self.store, &mut self.bridge);
        self.lifecycle.clear_all(&mut self.store);
        for (_, agent) in self.remote_agents.drain() {
            self.store.destroy(agent.entity);
        }
        let batch = self.store.flush_events();
        self.bridge.apply(&self.store, &batch);
        self.bridge.force_resync(&self.store);
        self.consistency_score = 1.0;
        let _ = self.events.send(WorldEvent::ResyncRequested);
    }

    fn enter_degraded_mode(&mut self) {
        if !self.degraded {
            self.degraded = true;
            self.chat.set_bubbles_enabled(false);
            self.chat.clear_bubbles(&mut self.store, &mut self.bridge);
            warn!("entering degraded mode");
            let _ = self.events.send(WorldEvent::DegradedMode(true));
        }
    }

    fn leave_degraded_mode(&mut self) {
        if self.degraded {
            self.degraded = false;
            self.chat.set_bubbles_enabled(true);
            info!("leaving degraded mode");
            let _ = self.events.send(WorldEvent::DegradedMode(false));
        }
    }

    fn tick(&mut self, now: Instant, dt: f32) {
        // 1. Object updates under the frame budget.
        self.lifecycle.drain(&mut self.store, now);
        for request in self.lifecycle.take_asset_requests() {
            let _ = self.events.send(WorldEvent::AssetWanted(request));
        }

        // 2. Avatar simulation against nearby colliders.
        let colliders = self.nearby_colliders();
        let ground = self.ground_height();
        self.avatar
            .tick(&mut self.store, dt, ground, &colliders, now);

        // 3. Remote agent interpolation.
        let render_time = self.started.elapsed();
        for agent in self.remote_agents.values_mut() {
            agent.buffer.prune(render_time);
            if let Some(state) = agent.buffer.sample_at(render_time) {
                self.store.set_position(agent.entity, Position(state.position));
                self.store.set_rotation(agent.entity, Rotation(state.rotation));
                self.store.set_velocity(agent.entity, Velocity(state.velocity));
            }
        }

        // 4. Chat bubbles and typing sweeps.
        self.chat
            .tick(&mut self.store, &mut self.bridge, self.avatar.position(), now);

        // 5. Cleanup queue, always; periodic stale/orphan scans.
        self.cleanup.process(&mut self.store, &mut self.lifecycle);
        if now.duration_since(self.last_cleanup_sweep) >= self.config.cleanup_interval {
            self.last_cleanup_sweep = now;
            for local_id in self.lifecycle.stale_objects(now) {
                self.cleanup.enqueue(CleanupOp::new(
                    CleanupKind::Stale,
                    CleanupTarget::LocalId(local_id),
                    "no update in stale window",
                ));
            }
        }
        if now.duration_since(self.last_consistency) >= self.config.orphan_check_interval {
            self.last_consistency = now;
            self.run_consistency_pass();
        }

        // 6. Memory pressure.
        if now.duration_since(self.last_memory_probe) >= Duration::from_secs(5) {
            self.last_memory_probe = now;
            self.probe_memory();
        }

        // 7. Outbound movement, with an animation announcement on every
        // state transition.
        if let Some(identity) = self.identity {
            if let Some(update) =
                self.avatar
                    .maybe_agent_update(identity.agent_id, identity.session_id, now)
            {
                let _ = self.outbound.send(Message::AgentUpdate(update));
            }
            let state = self.avatar.state();
            if self.announced_state != Some(state) {
                if let Some(previous) = self.announced_state {
                    let _ = self.outbound.send(Message::AgentAnimation {
                        agent_id: identity.agent_id,
                        session_id: identity.session_id,
                        animation_state: previous as u8,
                        start: false,
                    });
                }
                let _ = self.outbound.send(Message::AgentAnimation {
                    agent_id: identity.agent_id,
                    session_id: identity.session_id,
                    animation_state: state as u8,
                    start: true,
                });
                self.announced_state = Some(state);
            }
        }

        // 8. Publish the frame's changes as one batch.
        let batch = self.store.flush_events();
        self.bridge.apply(&self.store, &batch);

        self.ticks_in_window += 1;
        let window = now.duration_since(self.last_stats);
        if window >= Duration::from_secs(1) {
            self.last_stats = now;
            self.publish_stats(now, window);
        }
    }

    fn run_consistency_pass(&mut self) {
        let findings = self
            .checker
            .check(&self.store, &self.lifecycle, &self.bridge);
        let mut corrupted = false;
        let finding_count = findings.len();
        for finding in findings {
            if finding.is_corruption() {
                corrupted = true;
                continue;
            }
            if let Some(op) = finding.cleanup_op() {
                self.cleanup.enqueue(op);
            }
        }
        // Each finding dents the consistency input; corruption zeroes it
        // until a clean pass.
        self.consistency_score = if corrupted {
            0.0
        } else {
            (1.0 - finding_count as f32 / 10.0).max(0.0)
        };
        if corrupted {
            self.apply_recovery(ErrorReport::new(
                ErrorComponent::Entity,
                ErrorSeverity::Critical,
                "corrupted state detected",
            ));
        }
    }

    fn probe_memory(&mut self) {
        let (level, _usage) = self.memory.probe();
        match level {
            MemoryLevel::Normal => self.leave_degraded_mode(),
            MemoryLevel::Warning => {
                let _ = self.events.send(WorldEvent::MemoryPressure(level));
                self.cleanup.set_emergency(true);
                for local_id in self.lifecycle.stale_objects(Instant::now()) {
                    self.cleanup.enqueue(CleanupOp::new(
                        CleanupKind::Emergency,
                        CleanupTarget::LocalId(local_id),
                        "memory warning",
                    ));
                }
            }
            MemoryLevel::Critical => {
                let _ = self.events.send(WorldEvent::MemoryPressure(level));
                self.enter_degraded_mode();
                self.cleanup.enqueue_distance_cull(
                    &self.store,
                    &self.lifecycle,
                    self.avatar.position(),
                    self.config.cull_distance,
                    self.config.memory_capacity_target,
                );
            }
        }
    }

    fn nearby_colliders(&self) -> Vec<NearbyCollider> {
        let avatar_position = self.avatar.position();
        let mut colliders: Vec<NearbyCollider> = self
            .store
            .iter_sim_objects()
            .filter_map(|(entity, _)| {
                let position = self.store.position(entity)?.0;
                if position.distance(avatar_position) > self.config.collider_broadphase {
                    return None;
                }
                let scale = self.store.scale(entity).map(|s| s.0).unwrap_or(Vec3::ONE);
                Some(NearbyCollider {
                    position,
                    radius: scale.max_element() * 0.5,
                })
            })
            .collect();

        // Other avatars collide as capsules too.
        for agent in self.remote_agents.values() {
            if let Some(position) = self.store.position(agent.entity) {
                if position.0.distance(avatar_position) <= self.config.collider_broadphase {
                    colliders.push(NearbyCollider {
                        position: position.0,
                        radius: self.config.avatar.radius,
                    });
                }
            }
        }
        colliders
    }

    fn ground_height(&self) -> f32 {
        self.region_entity
            .and_then(|entity| self.store.region_boundary(entity))
            .map(|region| region.water_height)
            .unwrap_or(0.0)
    }

    fn publish_stats(&mut self, now: Instant, window: Duration) {
        // Measured tick rate over the window just closed.
        let frame_rate = if window.is_zero() {
            0.0
        } else {
            self.ticks_in_window as f32 / window.as_secs_f32()
        };
        self.ticks_in_window = 0;

        // Ten recent errors saturate the normalized rate.
        let error_rate = (self.recovery.recent_total_errors(now) as f32 / 10.0).clamp(0.0, 1.0);

        let inputs = HealthInputs {
            connection_stability: if self.identity.is_some() { 1.0 } else { 0.0 },
            state_consistency: self.consistency_score,
            error_rate,
            memory_pressure: self.memory.pressure(),
            frame_rate,
            latency: self.observed_rtt.unwrap_or_else(|| Duration::from_millis(50)),
        };
        let health = health_score(&inputs);
        if self.last_health_band != Some(health.band) {
            self.last_health_band = Some(health.band);
            let _ = self.events.send(WorldEvent::HealthChanged(health.band));
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.entity_count = self.store.entity_count();
            stats.tracked_objects = self.lifecycle.tracked_count();
            stats.queued_updates = self.lifecycle.queued_count();
            stats.cleanup_pending = self.cleanup.len();
            stats.chat_history = self.chat.history_len();
            stats.neighbor_regions = self.neighbors.len();
            stats.region_time_usec = self
                .region_time
                .map(|(usec, heard_at)| usec + heard_at.elapsed().as_micros() as u64);
            stats.health = Some(health);
        }
    }
}
