//! Circuit handshake state machine.
//!
//! Drives a fresh circuit from `NotStarted` to `Complete`:
//! UseCircuitCode out, RegionHandshake in, RegionHandshakeReply and
//! CompleteAgentMovement out, AgentMovementComplete in. Calling
//! [`Handshake::start`] in any state resets the machine and proceeds;
//! re-entry is an ordinary part of the reconnect path, never an error.

use crate::networking::circuit::Circuit;
use crate::networking::messages::Message;
use crate::networking::{NetworkError, NetworkResult};
use glam::Vec3;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handshake progress. `Failed` is sticky until the next `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    SentUseCircuitCode,
    ReceivedRegionHandshake,
    SentRegionHandshakeReply,
    SentCompleteAgentMovement,
    ReceivedAgentMovementComplete,
    Complete,
    Failed(String),
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeState::NotStarted => write!(f, "NotStarted"),
            HandshakeState::SentUseCircuitCode => write!(f, "SentUseCircuitCode"),
            HandshakeState::ReceivedRegionHandshake => write!(f, "ReceivedRegionHandshake"),
            HandshakeState::SentRegionHandshakeReply => write!(f, "SentRegionHandshakeReply"),
            HandshakeState::SentCompleteAgentMovement => write!(f, "SentCompleteAgentMovement"),
            HandshakeState::ReceivedAgentMovementComplete => write!(f, "ReceivedAgentMovementComplete"),
            HandshakeState::Complete => write!(f, "Complete"),
            HandshakeState::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Circuit identity. Regenerated wholesale on every reset; session-
/// dependent state downstream must treat a change as invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl SessionIdentity {
    fn generate() -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            circuit_code: rand::rng().random_range(100_000..=999_999),
        }
    }
}

/// Payload of the final handshake message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementComplete {
    pub position: Vec3,
    pub look_at: Vec3,
    pub region_handle: u64,
    pub timestamp: u32,
}

/// Region facts learned during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionInfo {
    pub sim_name: String,
    pub water_height: f32,
    pub region_handle: u64,
}

pub struct Handshake {
    circuit: Arc<Circuit>,
    state_tx: watch::Sender<HandshakeState>,
    identity: Mutex<SessionIdentity>,
    region: Mutex<Option<RegionInfo>>,
    completion: Mutex<Option<MovementComplete>>,
    timeout: Duration,
    /// Bumped on every reset so stale timeout tasks no-op.
    generation: AtomicU64,
    /// Serializes `start` so concurrent calls settle deterministically.
    start_gate: Mutex<()>,
}

impl Handshake {
    pub fn new(circuit: Arc<Circuit>, timeout: Duration) -> (Arc<Self>, watch::Receiver<HandshakeState>) {
        let (state_tx, state_rx) = watch::channel(HandshakeState::NotStarted);
        let handshake = Arc::new(Self {
            circuit,
            state_tx,
            identity: Mutex::new(SessionIdentity::generate()),
            region: Mutex::new(None),
            completion: Mutex::new(None),
            timeout,
            generation: AtomicU64::new(0),
            start_gate: Mutex::new(()),
        });
        (handshake, state_rx)
    }

    pub fn state(&self) -> HandshakeState {
        self.state_tx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == HandshakeState::Complete
    }

    pub async fn identity(&self) -> SessionIdentity {
        *self.identity.lock().await
    }

    pub async fn region_info(&self) -> Option<RegionInfo> {
        self.region.lock().await.clone()
    }

    pub async fn completion(&self) -> Option<MovementComplete> {
        *self.completion.lock().await
    }

    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: HandshakeState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        debug!("handshake: {} -> {}", previous, next);
        let _ = self.state_tx.send(next);
    }

    /// Reset to `NotStarted` with a fresh identity. Invalidates any
    /// pending timeout.
    pub async fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let fresh = SessionIdentity::generate();
        *self.identity.lock().await = fresh;
        *self.region.lock().await = None;
        *self.completion.lock().await = None;
        info!(
            circuit_code = fresh.circuit_code,
            "handshake reset, new session identity"
        );
        self.transition(HandshakeState::NotStarted);
    }

    /// Begin (or restart) the handshake. Idempotent by contract: from
    /// any state the machine resets itself and proceeds.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        let _gate = self.start_gate.lock().await;

        if self.state() != HandshakeState::NotStarted {
            debug!("start() while {}, resetting first", self.state());
            self.reset().await;
        }

        let identity = self.identity().await;
        self.circuit
            .send(&Message::UseCircuitCode {
                circuit_code: identity.circuit_code,
                session_id: identity.session_id,
                agent_id: identity.agent_id,
            })
            .await?;
        self.transition(HandshakeState::SentUseCircuitCode);

        self.spawn_timeout();
        Ok(())
    }

    fn spawn_timeout(self: &Arc<Self>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let handshake = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(handshake.timeout).await;
            if handshake.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let state = handshake.state();
            match state {
                HandshakeState::Complete | HandshakeState::NotStarted | HandshakeState::Failed(_) => {}
                HandshakeState::SentCompleteAgentMovement => {
                    handshake.fail("movement_timeout");
                }
                _ => handshake.fail("timeout"),
            }
        });
    }

    /// Record a failure. Recovery resets the machine before the next
    /// connect attempt.
    pub fn fail(&self, reason: &str) {
        warn!("handshake failed: {}", reason);
        self.transition(HandshakeState::Failed(reason.to_string()));
    }

    /// Feed a handshake-relevant inbound message. Non-handshake
    /// messages are ignored so the router can forward unconditionally.
    pub async fn handle_message(&self, message: &Message) -> NetworkResult<()> {
        match message {
            Message::RegionHandshake {
                sim_name,
                water_height,
                region_handle,
                ..
            } => {
                if self.state() != HandshakeState::SentUseCircuitCode {
                    debug!("ignoring RegionHandshake while {}", self.state());
                    return Ok(());
                }
                *self.region.lock().await = Some(RegionInfo {
                    sim_name: sim_name.clone(),
                    water_height: *water_height,
                    region_handle: *region_handle,
                });
                self.transition(HandshakeState::ReceivedRegionHandshake);

                let identity = self.identity().await;
                self.circuit
                    .send(&Message::RegionHandshakeReply {
                        agent_id: identity.agent_id,
                        session_id: identity.session_id,
                        flags: 0,
                    })
                    .await?;
                self.transition(HandshakeState::SentRegionHandshakeReply);

                self.circuit
                    .send(&Message::CompleteAgentMovement {
                        agent_id: identity.agent_id,
                        session_id: identity.session_id,
                        circuit_code: identity.circuit_code,
                    })
                    .await?;
                self.transition(HandshakeState::SentCompleteAgentMovement);
                Ok(())
            }
            Message::AgentMovementComplete {
                position,
                look_at,
                region_handle,
                timestamp,
                ..
            } => {
                if self.state() != HandshakeState::SentCompleteAgentMovement {
                    debug!("ignoring AgentMovementComplete while {}", self.state());
                    return Ok(());
                }
                self.transition(HandshakeState::ReceivedAgentMovementComplete);
                *self.completion.lock().await = Some(MovementComplete {
                    position: *position,
                    look_at: *look_at,
                    region_handle: *region_handle,
                    timestamp: *timestamp,
                });
                info!(region_handle, "handshake complete");
                self.transition(HandshakeState::Complete);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Propagate a network error into the machine.
    pub fn on_network_error(&self, error: &NetworkError) {
        if !matches!(self.state(), HandshakeState::Complete | HandshakeState::NotStarted) {
            self.fail(&error.to_string());
        }
    }
}
