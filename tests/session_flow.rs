//! End-to-end session tests against a scripted simulator on loopback
//! UDP: circuit establishment, object lifecycle, chat, and reconnect.

use glam::{Quat, Vec3};
use slipstream::config::RuntimeConfig;
use slipstream::networking::codec::{Packet, PacketFlags};
use slipstream::networking::handshake::HandshakeState;
use slipstream::networking::messages::{
    ChatSourceType, ChatType, FullObjectData, Message, ObjectUpdateData, PrimKind,
    TerseObjectData,
};
use slipstream::networking::{Client, ClientEvent};
use slipstream::world::components::{Physics, Visual};
use slipstream::world::render::{RenderSink, Transform};
use slipstream::world::sim::WorldEvent;
use slipstream::world::{EntityId, VisualKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Scripted region simulator: acks reliable traffic, answers the
/// handshake, and relays whatever the test asks it to send.
struct MockSim {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Message>,
    inject: mpsc::UnboundedSender<Message>,
}

async fn spawn_mock_sim() -> MockSim {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Message>();

    let seq = Arc::new(AtomicU32::new(1));
    let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    let send_message = {
        let socket = Arc::clone(&socket);
        let seq = Arc::clone(&seq);
        move |message: Message, to: SocketAddr| {
            let socket = Arc::clone(&socket);
            let sequence = seq.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut flags = PacketFlags::empty();
                if message.is_reliable() {
                    flags |= PacketFlags::RELIABLE | PacketFlags::ACK_NEEDED;
                }
                let packet = Packet::new(
                    flags,
                    sequence,
                    message.message_type().id(),
                    message.encode_body(),
                );
                let _ = socket.send_to(&packet.serialize().unwrap(), to).await;
            }
        }
    };

    // Receive half: ack, answer the handshake, report upward.
    {
        let socket = Arc::clone(&socket);
        let peer = Arc::clone(&peer);
        let send_message = send_message.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                *peer.lock().unwrap() = Some(from);
                let Ok(packet) = Packet::parse(&buf[..len]) else {
                    continue;
                };
                if packet.wants_ack() {
                    send_message(
                        Message::PacketAck {
                            ids: vec![packet.sequence],
                        },
                        from,
                    )
                    .await;
                }
                let Ok(message) = Message::decode(packet.message_type, &packet.body) else {
                    continue;
                };

                match &message {
                    Message::UseCircuitCode { .. } => {
                        send_message(
                            Message::RegionHandshake {
                                region_flags: 0,
                                sim_name: "TestRegion".to_string(),
                                water_height: 20.0,
                                region_handle: 0x0001,
                            },
                            from,
                        )
                        .await;
                    }
                    Message::CompleteAgentMovement {
                        agent_id,
                        session_id,
                        ..
                    } => {
                        send_message(
                            Message::AgentMovementComplete {
                                agent_id: *agent_id,
                                session_id: *session_id,
                                position: Vec3::new(128.0, 25.0, 128.0),
                                look_at: Vec3::X,
                                region_handle: 0x0001,
                                timestamp: 1,
                            },
                            from,
                        )
                        .await;
                    }
                    _ => {}
                }
                let _ = received_tx.send(message);
            }
        });
    }

    // Inject half: relay test-scripted messages once the peer is known.
    {
        let peer = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(message) = inject_rx.recv().await {
                let to = loop {
                    if let Some(to) = *peer.lock().unwrap() {
                        break to;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                };
                send_message(message, to).await;
            }
        });
    }

    MockSim {
        addr,
        received: received_rx,
        inject: inject_tx,
    }
}

/// Render sink that records structural calls for assertions.
#[derive(Default)]
struct RecordingSink {
    log: Arc<Mutex<Vec<String>>>,
    anchors: u64,
}

impl RenderSink for RecordingSink {
    fn entity_created(&mut self, handle: EntityId, _: VisualKind, t: Transform, _: &Visual) {
        self.log
            .lock()
            .unwrap()
            .push(format!("create {} {:?}", handle.raw(), t.position));
    }

    fn entity_destroyed(&mut self, handle: EntityId) {
        self.log.lock().unwrap().push(format!("destroy {}", handle.raw()));
    }

    fn entity_transform_changed(&mut self, handle: EntityId, t: Transform) {
        self.log
            .lock()
            .unwrap()
            .push(format!("transform {} {:?}", handle.raw(), t.position));
    }

    fn entity_material_changed(&mut self, handle: EntityId, _: &Visual) {
        self.log.lock().unwrap().push(format!("material {}", handle.raw()));
    }

    fn entity_physics_changed(&mut self, _: EntityId, _: Option<&Physics>) {}

    fn add_anchor(&mut self, position: Vec3) -> u64 {
        self.anchors += 1;
        self.log.lock().unwrap().push(format!("anchor {position:?}"));
        self.anchors
    }

    fn remove_anchor(&mut self, anchor: u64) {
        self.log.lock().unwrap().push(format!("unanchor {anchor}"));
    }
}

async fn wait_for_complete(client: &Client) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !client.is_connected() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "handshake never completed: {}",
            client.handshake_state()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn full_object(local_id: u32, position: Vec3) -> Message {
    Message::ObjectUpdate {
        region_handle: 0x0001,
        data: ObjectUpdateData::Full(FullObjectData {
            local_id,
            full_id: Uuid::new_v4(),
            owner_id: Uuid::nil(),
            group_id: Uuid::nil(),
            parent_local_id: 0,
            kind: PrimKind::Box,
            position,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            base_color: [255; 4],
            material_ref: Uuid::nil(),
            mesh_ref: Uuid::nil(),
            flags: 0,
            click_action: 0,
            name: "crate".to_string(),
            description: String::new(),
        }),
    }
}

#[tokio::test]
async fn test_circuit_establishment() {
    let mut sim = spawn_mock_sim().await;
    let client = Client::connect(
        sim.addr,
        RuntimeConfig::default(),
        Box::new(RecordingSink::default()),
    )
    .await
    .unwrap();

    wait_for_complete(&client).await;

    // The simulator saw the full handshake sequence in order.
    let mut seen = Vec::new();
    while let Ok(message) = sim.received.try_recv() {
        seen.push(message.message_type());
    }
    use slipstream::networking::MessageType::*;
    let positions: Vec<usize> = [UseCircuitCode, RegionHandshakeReply, CompleteAgentMovement]
        .iter()
        .map(|t| seen.iter().position(|s| s == t).expect("missing step"))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "order: {seen:?}");

    client.shutdown();
}

#[tokio::test]
async fn test_object_create_update_kill() {
    let mut sim = spawn_mock_sim().await;
    let sink = RecordingSink::default();
    let log = Arc::clone(&sink.log);
    let client = Client::connect(sim.addr, RuntimeConfig::default(), Box::new(sink))
        .await
        .unwrap();
    wait_for_complete(&client).await;

    sim.inject
        .send(full_object(42, Vec3::new(10.0, 25.0, 10.0)))
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.statistics().await.sim.tracked_objects < 1 {
        assert!(tokio::time::Instant::now() < deadline, "object never created");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    sim.inject
        .send(Message::ObjectUpdate {
            region_handle: 0x0001,
            data: ObjectUpdateData::Terse(TerseObjectData {
                local_id: 42,
                position: Vec3::new(10.5, 25.0, 10.0),
                rotation: Quat::IDENTITY,
                velocity: Vec3::ZERO,
                angular_velocity: Vec3::ZERO,
            }),
        })
        .unwrap();
    sim.inject
        .send(Message::KillObject {
            local_ids: vec![42],
        })
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.statistics().await.sim.tracked_objects > 0 {
        assert!(tokio::time::Instant::now() < deadline, "object never killed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Give the render flush a frame.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let log = log.lock().unwrap();
    let create = log.iter().position(|l| l.starts_with("create")).expect("create");
    let transform = log
        .iter()
        .position(|l| l.starts_with("transform") && l.contains("10.5"))
        .expect("transform");
    let destroy = log.iter().position(|l| l.starts_with("destroy")).expect("destroy");
    assert!(create < transform && transform < destroy, "log: {log:?}");
    drop(log);

    client.shutdown();
}

#[tokio::test]
async fn test_chat_reaches_history_and_makes_bubble() {
    let sim = spawn_mock_sim().await;
    let sink = RecordingSink::default();
    let log = Arc::clone(&sink.log);
    let client = Client::connect(sim.addr, RuntimeConfig::default(), Box::new(sink))
        .await
        .unwrap();
    wait_for_complete(&client).await;
    // Let the avatar land at its spawn position first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    sim.inject
        .send(Message::ChatFromSimulator {
            from_name: "Bob".to_string(),
            source_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            source_type: ChatSourceType::Agent,
            chat_type: ChatType::Say,
            audible: true,
            position: Some(Vec3::new(130.0, 25.0, 128.0)),
            message: "hello".to_string(),
        })
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.statistics().await.sim.chat_history < 1 {
        assert!(tokio::time::Instant::now() < deadline, "chat never recorded");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(log.lock().unwrap().iter().any(|l| l.starts_with("anchor")));

    client.shutdown();
}

#[tokio::test]
async fn test_reconnect_after_connection_loss() {
    let mut sim = spawn_mock_sim().await;
    let client = Client::connect(
        sim.addr,
        RuntimeConfig::default(),
        Box::new(RecordingSink::default()),
    )
    .await
    .unwrap();
    wait_for_complete(&client).await;

    sim.inject
        .send(full_object(7, Vec3::new(120.0, 25.0, 120.0)))
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.statistics().await.sim.tracked_objects < 1 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Simulator closes the circuit: objects are cleared and the world
    // asks for a resync, which restarts the handshake with a fresh
    // identity rather than erroring out.
    let mut events = client.subscribe();
    sim.inject.send(Message::CloseCircuit).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut saw_resync = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(ClientEvent::World(WorldEvent::ResyncRequested))) => {
                saw_resync = true;
            }
            Ok(Ok(ClientEvent::StateChanged(HandshakeState::Complete))) if saw_resync => break,
            _ => {}
        }
    }
    assert!(saw_resync, "no resync after connection loss");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = client.statistics().await;
        if stats.sim.tracked_objects == 0 && client.is_connected() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "world not rebuilt after loss"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // A fresh UseCircuitCode arrived at the simulator.
    let mut reconnects = 0;
    while let Ok(message) = sim.received.try_recv() {
        if matches!(message, Message::UseCircuitCode { .. }) {
            reconnects += 1;
        }
    }
    assert!(reconnects >= 2, "expected a second circuit, saw {reconnects}");

    client.shutdown();
}

#[tokio::test]
async fn test_disconnect_stops_outbound() {
    let sim = spawn_mock_sim().await;
    let mut client = Client::connect(
        sim.addr,
        RuntimeConfig::default(),
        Box::new(RecordingSink::default()),
    )
    .await
    .unwrap();
    wait_for_complete(&client).await;

    client.disconnect().await;
    let sent_after_disconnect = client.statistics().await.datagrams_sent;
    // Drive input that would normally produce agent updates.
    client.input(slipstream::world::avatar::InputEvent::KeyDown(
        slipstream::world::avatar::MovementKey::Forward,
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        client.statistics().await.datagrams_sent,
        sent_after_disconnect,
        "datagrams emitted after disconnect"
    );

    client.shutdown();
}
