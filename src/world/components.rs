//! Component records for the entity store.
//!
//! Components are fixed-shape data attached to at most one entity each.
//! Entities are pure keys; everything observable lives here.

use crate::networking::messages::PrimKind;
use glam::{Quat, Vec3};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position(pub Vec3);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation(pub Quat);

impl Default for Rotation {
    fn default() -> Self {
        Rotation(Quat::IDENTITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale(pub Vec3);

impl Default for Scale {
    fn default() -> Self {
        Scale(Vec3::ONE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity(pub Vec3);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AngularVelocity(pub Vec3);

/// Identity and bookkeeping for a simulator-owned object.
#[derive(Debug, Clone, PartialEq)]
pub struct SimObject {
    pub local_id: u32,
    pub full_id: Uuid,
    pub owner_id: Uuid,
    pub group_id: Uuid,
    pub parent_local_id: u32,
    pub last_update_at: Instant,
    pub update_seq: u64,
}

/// Renderable shape classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualKind {
    Box,
    Cylinder,
    Sphere,
    Capsule,
    Mesh,
}

impl From<PrimKind> for VisualKind {
    fn from(kind: PrimKind) -> Self {
        match kind {
            PrimKind::Box => VisualKind::Box,
            PrimKind::Cylinder => VisualKind::Cylinder,
            PrimKind::Sphere => VisualKind::Sphere,
            PrimKind::Capsule => VisualKind::Capsule,
            PrimKind::Mesh => VisualKind::Mesh,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Visual {
    pub kind: VisualKind,
    pub base_color: [u8; 4],
    pub material_ref: Option<Uuid>,
    pub mesh_ref: Option<Uuid>,
}

impl Default for Visual {
    fn default() -> Self {
        Self {
            kind: VisualKind::Box,
            base_color: [255, 255, 255, 255],
            material_ref: None,
            mesh_ref: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Physics {
    pub mass: f32,
    pub friction: f32,
    pub restitution: f32,
    pub is_static: bool,
    pub shape: VisualKind,
}

/// The locally controlled avatar.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAvatar {
    pub display_name: String,
    pub appearance: Uuid,
}

/// Movement classification derived each tick from kinematic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementState {
    Idle,
    Walking,
    Running,
    Flying,
    Jumping,
    Falling,
    Sitting,
    Dancing,
    Custom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarMovement {
    pub state: MovementState,
    pub grounded: bool,
    pub last_ground_at: Instant,
    pub jump_count: u8,
    pub is_flying: bool,
    pub sit_target: Option<Uuid>,
}

impl Default for AvatarMovement {
    fn default() -> Self {
        Self {
            state: MovementState::Idle,
            grounded: true,
            last_ground_at: Instant::now(),
            jump_count: 0,
            is_flying: false,
            sit_target: None,
        }
    }
}

/// Capsule collision parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collision {
    pub radius: f32,
    pub height: f32,
    pub step_height: f32,
    pub enabled: bool,
}

impl Default for Collision {
    fn default() -> Self {
        Self {
            radius: 0.3,
            height: 1.8,
            step_height: 0.3,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionBoundary {
    pub region_handle: u64,
    pub size: f32,
    pub water_height: f32,
}

/// Ephemeral chat bubble above a speaker. Lifetime is bounded by the
/// display timer and distance culling.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatBubble {
    pub text: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub anchor: Option<u64>,
}
