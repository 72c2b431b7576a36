//! Typed message catalog for the simulator protocol.
//!
//! Message type identifiers are stable across implementations and must
//! not be renumbered. Bodies encode through [`ByteWriter`] and decode
//! through [`ByteReader`]; layouts follow the wire rules in the codec
//! module (big-endian integers, raw 16-byte UUIDs, length-prefixed
//! strings).

use crate::networking::codec::{ByteReader, ByteWriter, CodecError};
use bytes::Bytes;
use glam::{Quat, Vec3};
use uuid::Uuid;

/// Stable numeric identifiers for every known message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Test = 1,
    PacketAck = 3,
    OpenCircuit = 4,
    CloseCircuit = 5,
    UseCircuitCode = 6,
    CompleteAgentMovement = 7,
    AgentUpdate = 8,
    AgentAnimation = 9,
    AgentRequestSit = 10,
    ObjectUpdate = 11,
    ObjectUpdateCompressed = 12,
    ObjectUpdateCached = 13,
    KillObject = 14,
    ChatFromSimulator = 15,
    ChatFromViewer = 16,
    InstantMessage = 17,
    TeleportLocationRequest = 18,
    TeleportLocal = 19,
    TeleportLandmarkRequest = 20,
    RegionHandshake = 21,
    RegionHandshakeReply = 22,
    SimulatorViewerTimeMessage = 23,
    StartPingCheck = 24,
    AgentMovementComplete = 25,
    CompletePingCheck = 26,
    TeleportFinish = 27,
    TeleportFailed = 28,
    EnableSimulator = 29,
    DisableSimulator = 30,
    PingCheck = 31,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        use MessageType::*;
        Some(match value {
            1 => Test,
            3 => PacketAck,
            4 => OpenCircuit,
            5 => CloseCircuit,
            6 => UseCircuitCode,
            7 => CompleteAgentMovement,
            8 => AgentUpdate,
            9 => AgentAnimation,
            10 => AgentRequestSit,
            11 => ObjectUpdate,
            12 => ObjectUpdateCompressed,
            13 => ObjectUpdateCached,
            14 => KillObject,
            15 => ChatFromSimulator,
            16 => ChatFromViewer,
            17 => InstantMessage,
            18 => TeleportLocationRequest,
            19 => TeleportLocal,
            20 => TeleportLandmarkRequest,
            21 => RegionHandshake,
            22 => RegionHandshakeReply,
            23 => SimulatorViewerTimeMessage,
            24 => StartPingCheck,
            25 => AgentMovementComplete,
            26 => CompletePingCheck,
            27 => TeleportFinish,
            28 => TeleportFailed,
            29 => EnableSimulator,
            30 => DisableSimulator,
            31 => PingCheck,
            _ => return None,
        })
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    /// Reliable messages belong to the handshake, teleport, and
    /// object-update families. Movement updates and pings are not.
    pub fn is_reliable(self) -> bool {
        use MessageType::*;
        matches!(
            self,
            OpenCircuit
                | CloseCircuit
                | UseCircuitCode
                | CompleteAgentMovement
                | RegionHandshake
                | RegionHandshakeReply
                | AgentMovementComplete
                | ObjectUpdate
                | ObjectUpdateCompressed
                | ObjectUpdateCached
                | KillObject
                | TeleportLocationRequest
                | TeleportLocal
                | TeleportLandmarkRequest
                | TeleportFinish
                | TeleportFailed
        )
    }
}

/// Primitive shape carried by object updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimKind {
    Box = 0,
    Cylinder = 1,
    Sphere = 2,
    Capsule = 3,
    Mesh = 4,
}

impl PrimKind {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => PrimKind::Box,
            1 => PrimKind::Cylinder,
            2 => PrimKind::Sphere,
            3 => PrimKind::Capsule,
            4 => PrimKind::Mesh,
            _ => return Err(CodecError::Truncated),
        })
    }
}

/// Complete object description from a full update.
#[derive(Debug, Clone, PartialEq)]
pub struct FullObjectData {
    pub local_id: u32,
    pub full_id: Uuid,
    pub owner_id: Uuid,
    pub group_id: Uuid,
    pub parent_local_id: u32,
    pub kind: PrimKind,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub base_color: [u8; 4],
    pub material_ref: Uuid,
    pub mesh_ref: Uuid,
    pub flags: u32,
    pub click_action: u8,
    pub name: String,
    pub description: String,
}

impl FullObjectData {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.local_id);
        w.put_uuid(self.full_id);
        w.put_uuid(self.owner_id);
        w.put_uuid(self.group_id);
        w.put_u32(self.parent_local_id);
        w.put_u8(self.kind as u8);
        w.put_vec3(self.position);
        w.put_quat(self.rotation);
        w.put_vec3(self.scale);
        w.put_vec3(self.velocity);
        w.put_vec3(self.angular_velocity);
        w.put_slice(&self.base_color);
        w.put_uuid(self.material_ref);
        w.put_uuid(self.mesh_ref);
        w.put_u32(self.flags);
        w.put_u8(self.click_action);
        w.put_str8(&self.name);
        w.put_str16(&self.description);
    }

    fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
        Ok(Self {
            local_id: r.read_u32()?,
            full_id: r.read_uuid()?,
            owner_id: r.read_uuid()?,
            group_id: r.read_uuid()?,
            parent_local_id: r.read_u32()?,
            kind: PrimKind::from_u8(r.read_u8()?)?,
            position: r.read_vec3()?,
            rotation: r.read_quat()?,
            scale: r.read_vec3()?,
            velocity: r.read_vec3()?,
            angular_velocity: r.read_vec3()?,
            base_color: {
                let raw = r.read_bytes(4)?;
                [raw[0], raw[1], raw[2], raw[3]]
            },
            material_ref: r.read_uuid()?,
            mesh_ref: r.read_uuid()?,
            flags: r.read_u32()?,
            click_action: r.read_u8()?,
            name: r.read_str8()?,
            description: r.read_str16()?,
        })
    }
}

/// Transform-only update.
#[derive(Debug, Clone, PartialEq)]
pub struct TerseObjectData {
    pub local_id: u32,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

/// Material and texture-entry change.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureObjectData {
    pub local_id: u32,
    pub base_color: [u8; 4],
    pub material_ref: Uuid,
}

/// Flags, click action, and name/description change.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertiesObjectData {
    pub local_id: u32,
    pub flags: u32,
    pub click_action: u8,
    pub name: String,
    pub description: String,
}

/// Body of `ObjectUpdate`; a 1-byte tag selects the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectUpdateData {
    Full(FullObjectData),
    Terse(TerseObjectData),
    Texture(TextureObjectData),
    Properties(PropertiesObjectData),
}

impl ObjectUpdateData {
    pub fn local_id(&self) -> u32 {
        match self {
            ObjectUpdateData::Full(d) => d.local_id,
            ObjectUpdateData::Terse(d) => d.local_id,
            ObjectUpdateData::Texture(d) => d.local_id,
            ObjectUpdateData::Properties(d) => d.local_id,
        }
    }
}

// Field-presence bits for compressed updates. The always-present prefix
// is local_id, full_id, kind, position, rotation, scale.
const COMPRESSED_PARENT: u32 = 0x01;
const COMPRESSED_MOTION: u32 = 0x02;
const COMPRESSED_COLOR: u32 = 0x04;
const COMPRESSED_MATERIAL: u32 = 0x08;
const COMPRESSED_MESH: u32 = 0x10;
const COMPRESSED_PROPERTIES: u32 = 0x20;
const COMPRESSED_OWNERSHIP: u32 = 0x40;
const COMPRESSED_KNOWN_MASK: u32 = 0x7F;

/// Compact object description. Decodes into a [`FullObjectData`] with
/// defaults for absent field groups.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedObjectData {
    pub field_mask: u32,
    pub data: FullObjectData,
}

impl CompressedObjectData {
    /// Build from a full record, masking in only the groups that differ
    /// from defaults.
    pub fn from_full(data: FullObjectData) -> Self {
        let mut mask = 0;
        if data.parent_local_id != 0 {
            mask |= COMPRESSED_PARENT;
        }
        if data.velocity != Vec3::ZERO || data.angular_velocity != Vec3::ZERO {
            mask |= COMPRESSED_MOTION;
        }
        if data.base_color != [255, 255, 255, 255] {
            mask |= COMPRESSED_COLOR;
        }
        if !data.material_ref.is_nil() {
            mask |= COMPRESSED_MATERIAL;
        }
        if !data.mesh_ref.is_nil() {
            mask |= COMPRESSED_MESH;
        }
        if data.flags != 0 || data.click_action != 0 || !data.name.is_empty() || !data.description.is_empty() {
            mask |= COMPRESSED_PROPERTIES;
        }
        if !data.owner_id.is_nil() || !data.group_id.is_nil() {
            mask |= COMPRESSED_OWNERSHIP;
        }
        Self { field_mask: mask, data }
    }

    fn encode(&self, w: &mut ByteWriter) {
        let d = &self.data;
        w.put_u32(self.field_mask);
        w.put_u32(d.local_id);
        w.put_uuid(d.full_id);
        w.put_u8(d.kind as u8);
        w.put_vec3(d.position);
        w.put_quat(d.rotation);
        w.put_vec3(d.scale);
        if self.field_mask & COMPRESSED_PARENT != 0 {
            w.put_u32(d.parent_local_id);
        }
        if self.field_mask & COMPRESSED_MOTION != 0 {
            w.put_vec3(d.velocity);
            w.put_vec3(d.angular_velocity);
        }
        if self.field_mask & COMPRESSED_COLOR != 0 {
            w.put_slice(&d.base_color);
        }
        if self.field_mask & COMPRESSED_MATERIAL != 0 {
            w.put_uuid(d.material_ref);
        }
        if self.field_mask & COMPRESSED_MESH != 0 {
            w.put_uuid(d.mesh_ref);
        }
        if self.field_mask & COMPRESSED_PROPERTIES != 0 {
            w.put_u32(d.flags);
            w.put_u8(d.click_action);
            w.put_str8(&d.name);
            w.put_str16(&d.description);
        }
        if self.field_mask & COMPRESSED_OWNERSHIP != 0 {
            w.put_uuid(d.owner_id);
            w.put_uuid(d.group_id);
        }
    }

    fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
        let field_mask = r.read_u32()?;
        if field_mask & !COMPRESSED_KNOWN_MASK != 0 {
            return Err(CodecError::Truncated);
        }

        let mut data = FullObjectData {
            local_id: r.read_u32()?,
            full_id: r.read_uuid()?,
            owner_id: Uuid::nil(),
            group_id: Uuid::nil(),
            parent_local_id: 0,
            kind: PrimKind::from_u8(r.read_u8()?)?,
            position: r.read_vec3()?,
            rotation: r.read_quat()?,
            scale: r.read_vec3()?,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            base_color: [255, 255, 255, 255],
            material_ref: Uuid::nil(),
            mesh_ref: Uuid::nil(),
            flags: 0,
            click_action: 0,
            name: String::new(),
            description: String::new(),
        };

        if field_mask & COMPRESSED_PARENT != 0 {
            data.parent_local_id = r.read_u32()?;
        }
        if field_mask & COMPRESSED_MOTION != 0 {
            data.velocity = r.read_vec3()?;
            data.angular_velocity = r.read_vec3()?;
        }
        if field_mask & COMPRESSED_COLOR != 0 {
            let raw = r.read_bytes(4)?;
            data.base_color = [raw[0], raw[1], raw[2], raw[3]];
        }
        if field_mask & COMPRESSED_MATERIAL != 0 {
            data.material_ref = r.read_uuid()?;
        }
        if field_mask & COMPRESSED_MESH != 0 {
            data.mesh_ref = r.read_uuid()?;
        }
        if field_mask & COMPRESSED_PROPERTIES != 0 {
            data.flags = r.read_u32()?;
            data.click_action = r.read_u8()?;
            data.name = r.read_str8()?;
            data.description = r.read_str16()?;
        }
        if field_mask & COMPRESSED_OWNERSHIP != 0 {
            data.owner_id = r.read_uuid()?;
            data.group_id = r.read_uuid()?;
        }

        Ok(Self { field_mask, data })
    }
}

/// Chat source classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChatSourceType {
    Agent = 0,
    Object = 1,
    System = 2,
}

impl ChatSourceType {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => ChatSourceType::Agent,
            1 => ChatSourceType::Object,
            2 => ChatSourceType::System,
            _ => return Err(CodecError::Truncated),
        })
    }
}

/// Chat delivery class; each carries its own audibility radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChatType {
    Whisper = 0,
    Say = 1,
    Shout = 2,
    Region = 3,
    Owner = 4,
    Debug = 5,
    System = 6,
    Broadcast = 7,
}

impl ChatType {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => ChatType::Whisper,
            1 => ChatType::Say,
            2 => ChatType::Shout,
            3 => ChatType::Region,
            4 => ChatType::Owner,
            5 => ChatType::Debug,
            6 => ChatType::System,
            7 => ChatType::Broadcast,
            _ => return Err(CodecError::Truncated),
        })
    }

    /// Audibility radius in meters; `None` is unbounded.
    pub fn radius(self) -> Option<f32> {
        match self {
            ChatType::Whisper => Some(10.0),
            ChatType::Say => Some(20.0),
            ChatType::Shout => Some(100.0),
            ChatType::Owner => Some(20.0),
            ChatType::Region | ChatType::System | ChatType::Broadcast => None,
            ChatType::Debug => None,
        }
    }
}

// Instant-message dialog codes.
pub const IM_DIALOG_MESSAGE: u8 = 0;
pub const IM_DIALOG_TYPING_START: u8 = 41;
pub const IM_DIALOG_TYPING_STOP: u8 = 42;

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Test {
        value: u32,
    },
    PacketAck {
        ids: Vec<u32>,
    },
    OpenCircuit,
    CloseCircuit,
    UseCircuitCode {
        circuit_code: u32,
        session_id: Uuid,
        agent_id: Uuid,
    },
    CompleteAgentMovement {
        agent_id: Uuid,
        session_id: Uuid,
        circuit_code: u32,
    },
    AgentUpdate(AgentUpdateData),
    AgentAnimation {
        agent_id: Uuid,
        session_id: Uuid,
        animation_state: u8,
        start: bool,
    },
    AgentRequestSit {
        agent_id: Uuid,
        session_id: Uuid,
        target_id: Uuid,
        offset: Vec3,
    },
    ObjectUpdate {
        region_handle: u64,
        data: ObjectUpdateData,
    },
    ObjectUpdateCompressed {
        region_handle: u64,
        data: CompressedObjectData,
    },
    ObjectUpdateCached {
        local_id: u32,
        mesh_ref: Uuid,
        material_ref: Uuid,
        update_flags: u32,
    },
    KillObject {
        local_ids: Vec<u32>,
    },
    ChatFromSimulator {
        from_name: String,
        source_id: Uuid,
        owner_id: Uuid,
        source_type: ChatSourceType,
        chat_type: ChatType,
        audible: bool,
        position: Option<Vec3>,
        message: String,
    },
    ChatFromViewer {
        agent_id: Uuid,
        session_id: Uuid,
        message: String,
        chat_type: ChatType,
        channel: i32,
    },
    InstantMessage {
        agent_id: Uuid,
        session_id: Uuid,
        im_session_id: Uuid,
        to_agent_id: Uuid,
        from_name: String,
        message: String,
        dialog: u8,
        timestamp: u32,
    },
    TeleportLocationRequest {
        agent_id: Uuid,
        session_id: Uuid,
        region_handle: u64,
        position: Vec3,
        look_at: Vec3,
    },
    TeleportLocal {
        agent_id: Uuid,
        position: Vec3,
        look_at: Vec3,
        teleport_flags: u32,
    },
    TeleportLandmarkRequest {
        agent_id: Uuid,
        session_id: Uuid,
        landmark_id: Uuid,
    },
    RegionHandshake {
        region_flags: u32,
        sim_name: String,
        water_height: f32,
        region_handle: u64,
    },
    RegionHandshakeReply {
        agent_id: Uuid,
        session_id: Uuid,
        flags: u32,
    },
    SimulatorViewerTimeMessage {
        usec_since_start: u64,
        sec_per_day: u32,
        sun_phase: f32,
    },
    StartPingCheck {
        ping_id: u8,
        oldest_unacked: u32,
    },
    AgentMovementComplete {
        agent_id: Uuid,
        session_id: Uuid,
        position: Vec3,
        look_at: Vec3,
        region_handle: u64,
        timestamp: u32,
    },
    CompletePingCheck {
        ping_id: u8,
    },
    TeleportFinish {
        agent_id: Uuid,
        region_handle: u64,
        position: Vec3,
        look_at: Vec3,
        teleport_flags: u32,
    },
    TeleportFailed {
        agent_id: Uuid,
        reason: String,
    },
    EnableSimulator {
        region_handle: u64,
        ip: u32,
        port: u16,
    },
    DisableSimulator,
    PingCheck {
        ping_id: u8,
    },
}

/// Full agent state report, sent at most 20 times a second.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentUpdateData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub body_rotation: Quat,
    pub head_rotation: Quat,
    pub state: u8,
    pub position: Vec3,
    pub look_at: Vec3,
    pub up_axis: Vec3,
    pub left_axis: Vec3,
    pub camera_center: Vec3,
    pub camera_at_axis: Vec3,
    pub camera_left_axis: Vec3,
    pub camera_up_axis: Vec3,
    pub far: f32,
    pub aspect_ratio: f32,
    pub throttles: [u8; 4],
    pub control_flags: u32,
    pub flags: u8,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        use Message::*;
        match self {
            Test { .. } => MessageType::Test,
            PacketAck { .. } => MessageType::PacketAck,
            OpenCircuit => MessageType::OpenCircuit,
            CloseCircuit => MessageType::CloseCircuit,
            UseCircuitCode { .. } => MessageType::UseCircuitCode,
            CompleteAgentMovement { .. } => MessageType::CompleteAgentMovement,
            AgentUpdate(_) => MessageType::AgentUpdate,
            AgentAnimation { .. } => MessageType::AgentAnimation,
            AgentRequestSit { .. } => MessageType::AgentRequestSit,
            ObjectUpdate { .. } => MessageType::ObjectUpdate,
            ObjectUpdateCompressed { .. } => MessageType::ObjectUpdateCompressed,
            ObjectUpdateCached { .. } => MessageType::ObjectUpdateCached,
            KillObject { .. } => MessageType::KillObject,
            ChatFromSimulator { .. } => MessageType::ChatFromSimulator,
            ChatFromViewer { .. } => MessageType::ChatFromViewer,
            InstantMessage { .. } => MessageType::InstantMessage,
            TeleportLocationRequest { .. } => MessageType::TeleportLocationRequest,
            TeleportLocal { .. } => MessageType::TeleportLocal,
            TeleportLandmarkRequest { .. } => MessageType::TeleportLandmarkRequest,
            RegionHandshake { .. } => MessageType::RegionHandshake,
            RegionHandshakeReply { .. } => MessageType::RegionHandshakeReply,
            SimulatorViewerTimeMessage { .. } => MessageType::SimulatorViewerTimeMessage,
            StartPingCheck { .. } => MessageType::StartPingCheck,
            AgentMovementComplete { .. } => MessageType::AgentMovementComplete,
            CompletePingCheck { .. } => MessageType::CompletePingCheck,
            TeleportFinish { .. } => MessageType::TeleportFinish,
            TeleportFailed { .. } => MessageType::TeleportFailed,
            EnableSimulator { .. } => MessageType::EnableSimulator,
            DisableSimulator => MessageType::DisableSimulator,
            PingCheck { .. } => MessageType::PingCheck,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.message_type().is_reliable()
    }

    /// Serialize the message body.
    pub fn encode_body(&self) -> Bytes {
        let mut w = ByteWriter::new();
        match self {
            Message::Test { value } => w.put_u32(*value),
            Message::PacketAck { ids } => {
                w.put_u8(ids.len().min(u8::MAX as usize) as u8);
                for id in ids.iter().take(u8::MAX as usize) {
                    w.put_u32(*id);
                }
            }
            Message::OpenCircuit | Message::CloseCircuit | Message::DisableSimulator => {}
            Message::UseCircuitCode {
                circuit_code,
                session_id,
                agent_id,
            } => {
                w.put_u32(*circuit_code);
                w.put_uuid(*session_id);
                w.put_uuid(*agent_id);
            }
            Message::CompleteAgentMovement {
                agent_id,
                session_id,
                circuit_code,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_u32(*circuit_code);
            }
            Message::AgentUpdate(d) => {
                w.put_uuid(d.agent_id);
                w.put_uuid(d.session_id);
                w.put_quat(d.body_rotation);
                w.put_quat(d.head_rotation);
                w.put_u8(d.state);
                w.put_vec3(d.position);
                w.put_vec3(d.look_at);
                w.put_vec3(d.up_axis);
                w.put_vec3(d.left_axis);
                w.put_vec3(d.camera_center);
                w.put_vec3(d.camera_at_axis);
                w.put_vec3(d.camera_left_axis);
                w.put_vec3(d.camera_up_axis);
                w.put_f32(d.far);
                w.put_f32(d.aspect_ratio);
                w.put_slice(&d.throttles);
                w.put_u32(d.control_flags);
                w.put_u8(d.flags);
            }
            Message::AgentAnimation {
                agent_id,
                session_id,
                animation_state,
                start,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_u8(*animation_state);
                w.put_bool(*start);
            }
            Message::AgentRequestSit {
                agent_id,
                session_id,
                target_id,
                offset,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_uuid(*target_id);
                w.put_vec3(*offset);
            }
            Message::ObjectUpdate {
                region_handle,
                data,
            } => {
                w.put_u64(*region_handle);
                match data {
                    ObjectUpdateData::Full(d) => {
                        w.put_u8(0);
                        d.encode(&mut w);
                    }
                    ObjectUpdateData::Terse(d) => {
                        w.put_u8(1);
                        w.put_u32(d.local_id);
                        w.put_vec3(d.position);
                        w.put_quat(d.rotation);
                        w.put_vec3(d.velocity);
                        w.put_vec3(d.angular_velocity);
                    }
                    ObjectUpdateData::Texture(d) => {
                        w.put_u8(2);
                        w.put_u32(d.local_id);
                        w.put_slice(&d.base_color);
                        w.put_uuid(d.material_ref);
                    }
                    ObjectUpdateData::Properties(d) => {
                        w.put_u8(3);
                        w.put_u32(d.local_id);
                        w.put_u32(d.flags);
                        w.put_u8(d.click_action);
                        w.put_str8(&d.name);
                        w.put_str16(&d.description);
                    }
                }
            }
            Message::ObjectUpdateCompressed {
                region_handle,
                data,
            } => {
                w.put_u64(*region_handle);
                data.encode(&mut w);
            }
            Message::ObjectUpdateCached {
                local_id,
                mesh_ref,
                material_ref,
                update_flags,
            } => {
                w.put_u32(*local_id);
                w.put_uuid(*mesh_ref);
                w.put_uuid(*material_ref);
                w.put_u32(*update_flags);
            }
            Message::KillObject { local_ids } => {
                for id in local_ids {
                    w.put_u32(*id);
                }
            }
            Message::ChatFromSimulator {
                from_name,
                source_id,
                owner_id,
                source_type,
                chat_type,
                audible,
                position,
                message,
            } => {
                w.put_str8(from_name);
                w.put_uuid(*source_id);
                w.put_uuid(*owner_id);
                w.put_u8(*source_type as u8);
                w.put_u8(*chat_type as u8);
                w.put_bool(*audible);
                match position {
                    Some(p) => {
                        w.put_bool(true);
                        w.put_vec3(*p);
                    }
                    None => w.put_bool(false),
                }
                w.put_str16(message);
            }
            Message::ChatFromViewer {
                agent_id,
                session_id,
                message,
                chat_type,
                channel,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_str16(message);
                w.put_u8(*chat_type as u8);
                w.put_i32(*channel);
            }
            Message::InstantMessage {
                agent_id,
                session_id,
                im_session_id,
                to_agent_id,
                from_name,
                message,
                dialog,
                timestamp,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_uuid(*im_session_id);
                w.put_uuid(*to_agent_id);
                w.put_str8(from_name);
                w.put_str16(message);
                w.put_u8(*dialog);
                w.put_u32(*timestamp);
            }
            Message::TeleportLocationRequest {
                agent_id,
                session_id,
                region_handle,
                position,
                look_at,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_u64(*region_handle);
                w.put_vec3(*position);
                w.put_vec3(*look_at);
            }
            Message::TeleportLocal {
                agent_id,
                position,
                look_at,
                teleport_flags,
            } => {
                w.put_uuid(*agent_id);
                w.put_vec3(*position);
                w.put_vec3(*look_at);
                w.put_u32(*teleport_flags);
            }
            Message::TeleportLandmarkRequest {
                agent_id,
                session_id,
                landmark_id,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_uuid(*landmark_id);
            }
            Message::RegionHandshake {
                region_flags,
                sim_name,
                water_height,
                region_handle,
            } => {
                w.put_u32(*region_flags);
                w.put_str8(sim_name);
                w.put_f32(*water_height);
                w.put_u64(*region_handle);
            }
            Message::RegionHandshakeReply {
                agent_id,
                session_id,
                flags,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_u32(*flags);
            }
            Message::SimulatorViewerTimeMessage {
                usec_since_start,
                sec_per_day,
                sun_phase,
            } => {
                w.put_u64(*usec_since_start);
                w.put_u32(*sec_per_day);
                w.put_f32(*sun_phase);
            }
            Message::StartPingCheck {
                ping_id,
                oldest_unacked,
            } => {
                w.put_u8(*ping_id);
                w.put_u32(*oldest_unacked);
            }
            Message::AgentMovementComplete {
                agent_id,
                session_id,
                position,
                look_at,
                region_handle,
                timestamp,
            } => {
                w.put_uuid(*agent_id);
                w.put_uuid(*session_id);
                w.put_vec3(*position);
                w.put_vec3(*look_at);
                w.put_u64(*region_handle);
                w.put_u32(*timestamp);
            }
            Message::CompletePingCheck { ping_id } => w.put_u8(*ping_id),
            Message::TeleportFinish {
                agent_id,
                region_handle,
                position,
                look_at,
                teleport_flags,
            } => {
                w.put_uuid(*agent_id);
                w.put_u64(*region_handle);
                w.put_vec3(*position);
                w.put_vec3(*look_at);
                w.put_u32(*teleport_flags);
            }
            Message::TeleportFailed { agent_id, reason } => {
                w.put_uuid(*agent_id);
                w.put_str8(reason);
            }
            Message::EnableSimulator {
                region_handle,
                ip,
                port,
            } => {
                w.put_u64(*region_handle);
                w.put_u32(*ip);
                w.put_u16(*port);
            }
            Message::PingCheck { ping_id } => w.put_u8(*ping_id),
        }
        w.freeze()
    }

    /// Decode a message body for a known type identifier.
    pub fn decode(message_type: u32, body: &[u8]) -> Result<Self, CodecError> {
        let kind = MessageType::from_u32(message_type).ok_or(CodecError::UnknownType(message_type))?;
        let mut r = ByteReader::new(body);

        let message = match kind {
            MessageType::Test => Message::Test {
                value: r.read_u32()?,
            },
            MessageType::PacketAck => {
                let count = r.read_u8()? as usize;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(r.read_u32()?);
                }
                Message::PacketAck { ids }
            }
            MessageType::OpenCircuit => Message::OpenCircuit,
            MessageType::CloseCircuit => Message::CloseCircuit,
            MessageType::UseCircuitCode => Message::UseCircuitCode {
                circuit_code: r.read_u32()?,
                session_id: r.read_uuid()?,
                agent_id: r.read_uuid()?,
            },
            MessageType::CompleteAgentMovement => Message::CompleteAgentMovement {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                circuit_code: r.read_u32()?,
            },
            MessageType::AgentUpdate => Message::AgentUpdate(AgentUpdateData {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                body_rotation: r.read_quat()?,
                head_rotation: r.read_quat()?,
                state: r.read_u8()?,
                position: r.read_vec3()?,
                look_at: r.read_vec3()?,
                up_axis: r.read_vec3()?,
                left_axis: r.read_vec3()?,
                camera_center: r.read_vec3()?,
                camera_at_axis: r.read_vec3()?,
                camera_left_axis: r.read_vec3()?,
                camera_up_axis: r.read_vec3()?,
                far: r.read_f32()?,
                aspect_ratio: r.read_f32()?,
                throttles: {
                    let raw = r.read_bytes(4)?;
                    [raw[0], raw[1], raw[2], raw[3]]
                },
                control_flags: r.read_u32()?,
                flags: r.read_u8()?,
            }),
            MessageType::AgentAnimation => Message::AgentAnimation {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                animation_state: r.read_u8()?,
                start: r.read_bool()?,
            },
            MessageType::AgentRequestSit => Message::AgentRequestSit {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                target_id: r.read_uuid()?,
                offset: r.read_vec3()?,
            },
            MessageType::ObjectUpdate => {
                let region_handle = r.read_u64()?;
                let tag = r.read_u8()?;
                let data = match tag {
                    0 => ObjectUpdateData::Full(FullObjectData::decode(&mut r)?),
                    1 => ObjectUpdateData::Terse(TerseObjectData {
                        local_id: r.read_u32()?,
                        position: r.read_vec3()?,
                        rotation: r.read_quat()?,
                        velocity: r.read_vec3()?,
                        angular_velocity: r.read_vec3()?,
                    }),
                    2 => ObjectUpdateData::Texture(TextureObjectData {
                        local_id: r.read_u32()?,
                        base_color: {
                            let raw = r.read_bytes(4)?;
                            [raw[0], raw[1], raw[2], raw[3]]
                        },
                        material_ref: r.read_uuid()?,
                    }),
                    3 => ObjectUpdateData::Properties(PropertiesObjectData {
                        local_id: r.read_u32()?,
                        flags: r.read_u32()?,
                        click_action: r.read_u8()?,
                        name: r.read_str8()?,
                        description: r.read_str16()?,
                    }),
                    _ => return Err(CodecError::Truncated),
                };
                Message::ObjectUpdate {
                    region_handle,
                    data,
                }
            }
            MessageType::ObjectUpdateCompressed => Message::ObjectUpdateCompressed {
                region_handle: r.read_u64()?,
                data: CompressedObjectData::decode(&mut r)?,
            },
            MessageType::ObjectUpdateCached => Message::ObjectUpdateCached {
                local_id: r.read_u32()?,
                mesh_ref: r.read_uuid()?,
                material_ref: r.read_uuid()?,
                update_flags: r.read_u32()?,
            },
            MessageType::KillObject => {
                let mut local_ids = Vec::with_capacity(r.remaining() / 4);
                while !r.is_empty() {
                    local_ids.push(r.read_u32()?);
                }
                Message::KillObject { local_ids }
            }
            MessageType::ChatFromSimulator => Message::ChatFromSimulator {
                from_name: r.read_str8()?,
                source_id: r.read_uuid()?,
                owner_id: r.read_uuid()?,
                source_type: ChatSourceType::from_u8(r.read_u8()?)?,
                chat_type: ChatType::from_u8(r.read_u8()?)?,
                audible: r.read_bool()?,
                position: if r.read_bool()? {
                    Some(r.read_vec3()?)
                } else {
                    None
                },
                message: r.read_str16()?,
            },
            MessageType::ChatFromViewer => Message::ChatFromViewer {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                message: r.read_str16()?,
                chat_type: ChatType::from_u8(r.read_u8()?)?,
                channel: r.read_i32()?,
            },
            MessageType::InstantMessage => Message::InstantMessage {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                im_session_id: r.read_uuid()?,
                to_agent_id: r.read_uuid()?,
                from_name: r.read_str8()?,
                message: r.read_str16()?,
                dialog: r.read_u8()?,
                timestamp: r.read_u32()?,
            },
            MessageType::TeleportLocationRequest => Message::TeleportLocationRequest {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                region_handle: r.read_u64()?,
                position: r.read_vec3()?,
                look_at: r.read_vec3()?,
            },
            MessageType::TeleportLocal => Message::TeleportLocal {
                agent_id: r.read_uuid()?,
                position: r.read_vec3()?,
                look_at: r.read_vec3()?,
                teleport_flags: r.read_u32()?,
            },
            MessageType::TeleportLandmarkRequest => Message::TeleportLandmarkRequest {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                landmark_id: r.read_uuid()?,
            },
            MessageType::RegionHandshake => Message::RegionHandshake {
                region_flags: r.read_u32()?,
                sim_name: r.read_str8()?,
                water_height: r.read_f32()?,
                region_handle: r.read_u64()?,
            },
            MessageType::RegionHandshakeReply => Message::RegionHandshakeReply {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                flags: r.read_u32()?,
            },
            MessageType::SimulatorViewerTimeMessage => Message::SimulatorViewerTimeMessage {
                usec_since_start: r.read_u64()?,
                sec_per_day: r.read_u32()?,
                sun_phase: r.read_f32()?,
            },
            MessageType::StartPingCheck => Message::StartPingCheck {
                ping_id: r.read_u8()?,
                oldest_unacked: r.read_u32()?,
            },
            MessageType::AgentMovementComplete => Message::AgentMovementComplete {
                agent_id: r.read_uuid()?,
                session_id: r.read_uuid()?,
                position: r.read_vec3()?,
                look_at: r.read_vec3()?,
                region_handle: r.read_u64()?,
                timestamp: r.read_u32()?,
            },
            MessageType::CompletePingCheck => Message::CompletePingCheck {
                ping_id: r.read_u8()?,
            },
            MessageType::TeleportFinish => Message::TeleportFinish {
                agent_id: r.read_uuid()?,
                region_handle: r.read_u64()?,
                position: r.read_vec3()?,
                look_at: r.read_vec3()?,
                teleport_flags: r.read_u32()?,
            },
            MessageType::TeleportFailed => Message::TeleportFailed {
                agent_id: r.read_uuid()?,
                reason: r.read_str8()?,
            },
            MessageType::EnableSimulator => Message::EnableSimulator {
                region_handle: r.read_u64()?,
                ip: r.read_u32()?,
                port: r.read_u16()?,
            },
            MessageType::DisableSimulator => Message::DisableSimulator,
            MessageType::PingCheck => Message::PingCheck {
                ping_id: r.read_u8()?,
            },
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let body = message.encode_body();
        let decoded = Message::decode(message.message_type().id(), &body).unwrap();
        assert_eq!(decoded, message);
    }

    fn full_object() -> FullObjectData {
        FullObjectData {
            local_id: 42,
            full_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            parent_local_id: 0,
            kind: PrimKind::Box,
            position: Vec3::new(10.0, 25.0, 10.0),
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            base_color: [255, 255, 255, 255],
            material_ref: Uuid::nil(),
            mesh_ref: Uuid::nil(),
            flags: 0,
            click_action: 0,
            name: "crate".to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_catalog_ids_are_stable() {
        assert_eq!(MessageType::PacketAck.id(), 3);
        assert_eq!(MessageType::UseCircuitCode.id(), 6);
        assert_eq!(MessageType::ObjectUpdate.id(), 11);
        assert_eq!(MessageType::KillObject.id(), 14);
        assert_eq!(MessageType::RegionHandshake.id(), 21);
        assert_eq!(MessageType::AgentMovementComplete.id(), 25);
        assert_eq!(MessageType::PingCheck.id(), 31);
        assert_eq!(MessageType::from_u32(2), None);
    }

    #[test]
    fn test_reliability_families() {
        assert!(MessageType::UseCircuitCode.is_reliable());
        assert!(MessageType::ObjectUpdate.is_reliable());
        assert!(MessageType::TeleportFinish.is_reliable());
        assert!(!MessageType::AgentUpdate.is_reliable());
        assert!(!MessageType::StartPingCheck.is_reliable());
        assert!(!MessageType::ChatFromViewer.is_reliable());
    }

    #[test]
    fn test_handshake_bodies_round_trip() {
        round_trip(Message::UseCircuitCode {
            circuit_code: 123456,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        });
        round_trip(Message::RegionHandshake {
            region_flags: 0,
            sim_name: "TestRegion".to_string(),
            water_height: 20.0,
            region_handle: 0x0001,
        });
        round_trip(Message::RegionHandshakeReply {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            flags: 0,
        });
        round_trip(Message::AgentMovementComplete {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            position: Vec3::new(128.0, 25.0, 128.0),
            look_at: Vec3::X,
            region_handle: 0x0001,
            timestamp: 1234,
        });
    }

    #[test]
    fn test_object_update_variants_round_trip() {
        round_trip(Message::ObjectUpdate {
            region_handle: 1,
            data: ObjectUpdateData::Full(full_object()),
        });
        round_trip(Message::ObjectUpdate {
            region_handle: 1,
            data: ObjectUpdateData::Terse(TerseObjectData {
                local_id: 42,
                position: Vec3::new(10.5, 25.0, 10.0),
                rotation: Quat::IDENTITY,
                velocity: Vec3::new(0.1, 0.0, 0.0),
                angular_velocity: Vec3::ZERO,
            }),
        });
        round_trip(Message::KillObject {
            local_ids: vec![42, 43, 44],
        });
    }

    #[test]
    fn test_compressed_masks_defaults() {
        let mut full = full_object();
        full.velocity = Vec3::new(1.0, 0.0, 0.0);
        full.name = String::new();
        full.owner_id = Uuid::nil();

        let compressed = CompressedObjectData::from_full(full.clone());
        assert_ne!(compressed.field_mask & COMPRESSED_MOTION, 0);
        assert_eq!(compressed.field_mask & COMPRESSED_OWNERSHIP, 0);

        let body = Message::ObjectUpdateCompressed {
            region_handle: 1,
            data: compressed.clone(),
        }
        .encode_body();
        let decoded = Message::decode(MessageType::ObjectUpdateCompressed.id(), &body).unwrap();
        match decoded {
            Message::ObjectUpdateCompressed { data, .. } => {
                assert_eq!(data.data.velocity, full.velocity);
                // Ownership group was masked out; decoder restores defaults.
                assert!(data.data.owner_id.is_nil());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_compressed_rejects_unknown_mask() {
        let mut w = ByteWriter::new();
        w.put_u64(1);
        w.put_u32(0x8000_0000);
        let body = w.freeze();
        assert!(Message::decode(MessageType::ObjectUpdateCompressed.id(), &body).is_err());
    }

    #[test]
    fn test_chat_round_trip() {
        round_trip(Message::ChatFromSimulator {
            from_name: "Bob".to_string(),
            source_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            source_type: ChatSourceType::Agent,
            chat_type: ChatType::Say,
            audible: true,
            position: Some(Vec3::new(130.0, 25.0, 128.0)),
            message: "hello".to_string(),
        });
        round_trip(Message::ChatFromViewer {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            message: "hi there".to_string(),
            chat_type: ChatType::Say,
            channel: 0,
        });
    }

    #[test]
    fn test_chat_radii() {
        assert_eq!(ChatType::Whisper.radius(), Some(10.0));
        assert_eq!(ChatType::Say.radius(), Some(20.0));
        assert_eq!(ChatType::Shout.radius(), Some(100.0));
        assert_eq!(ChatType::Region.radius(), None);
    }

    #[test]
    fn test_agent_update_round_trip() {
        round_trip(Message::AgentUpdate(AgentUpdateData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            body_rotation: Quat::IDENTITY,
            head_rotation: Quat::IDENTITY,
            state: 1,
            position: Vec3::new(128.0, 25.0, 128.0),
            look_at: Vec3::X,
            up_axis: Vec3::Z,
            left_axis: Vec3::Y,
            camera_center: Vec3::new(125.0, 27.0, 128.0),
            camera_at_axis: Vec3::X,
            camera_left_axis: Vec3::Y,
            camera_up_axis: Vec3::Z,
            far: 256.0,
            aspect_ratio: 1.77,
            throttles: [0, 0, 0, 0],
            control_flags: 0x0001,
            flags: 0,
        }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            Message::decode(999, &[]),
            Err(CodecError::UnknownType(999))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let body = Message::UseCircuitCode {
            circuit_code: 1,
            session_id: Uuid::nil(),
            agent_id: Uuid::nil(),
        }
        .encode_body();
        assert!(matches!(
            Message::decode(MessageType::UseCircuitCode.id(), &body[..body.len() - 1]),
            Err(CodecError::Truncated)
        ));
    }
}
