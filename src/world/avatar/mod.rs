//! Local avatar movement: input, capsule kinematics, prediction, and
//! outbound agent updates.
//!
//! The controller simulates the avatar forward every tick from the
//! current input state; the rendered position is always the locally
//! simulated one, and authoritative corrections are blended in over
//! several ticks rather than snapped.

pub mod camera;
pub mod interpolation;

use crate::networking::messages::AgentUpdateData;
use crate::world::components::{
    AvatarMovement, Collision, LocalAvatar, MovementState, Position, Rotation, Velocity,
};
use crate::world::store::{EntityId, EntityStore};
use camera::CameraRig;
use glam::{Quat, Vec3};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

bitflags::bitflags! {
    /// Control bit field carried by `agentUpdate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u32 {
        const FORWARD = 0x01;
        const BACKWARD = 0x02;
        const LEFT = 0x04;
        const RIGHT = 0x08;
        const UP = 0x10;
        const DOWN = 0x20;
        const RUN = 0x40;
        const FLY = 0x80;
    }
}

/// Keys the input collaborator can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementKey {
    Forward,
    Backward,
    StrafeLeft,
    StrafeRight,
    Up,
    Down,
    Run,
    Fly,
    Jump,
}

/// Pointer gestures from the input collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    /// Move toward the pointer.
    PointerMove,
    /// Dual-tap: jump.
    DualTap,
}

/// Events from the external input layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyDown(MovementKey),
    KeyUp(MovementKey),
    MouseDelta { dx: f32, dy: f32 },
    Gesture(GestureKind),
}

/// Held-key state, updated from input events.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub forward: bool,
    pub backward: bool,
    pub strafe_left: bool,
    pub strafe_right: bool,
    pub up: bool,
    pub down: bool,
    pub run: bool,
    pub fly: bool,
    /// Latched until the next tick consumes it.
    pub jump_requested: bool,
}

impl InputState {
    pub fn apply_key(&mut self, key: MovementKey, pressed: bool) {
        match key {
            MovementKey::Forward => self.forward = pressed,
            MovementKey::Backward => self.backward = pressed,
            MovementKey::StrafeLeft => self.strafe_left = pressed,
            MovementKey::StrafeRight => self.strafe_right = pressed,
            MovementKey::Up => self.up = pressed,
            MovementKey::Down => self.down = pressed,
            MovementKey::Run => self.run = pressed,
            MovementKey::Fly => {
                if pressed {
                    self.fly = !self.fly;
                }
            }
            MovementKey::Jump => {
                if pressed {
                    self.jump_requested = true;
                }
            }
        }
    }

    pub fn control_flags(&self) -> ControlFlags {
        let mut flags = ControlFlags::empty();
        flags.set(ControlFlags::FORWARD, self.forward);
        flags.set(ControlFlags::BACKWARD, self.backward);
        flags.set(ControlFlags::LEFT, self.strafe_left);
        flags.set(ControlFlags::RIGHT, self.strafe_right);
        flags.set(ControlFlags::UP, self.up);
        flags.set(ControlFlags::DOWN, self.down);
        flags.set(ControlFlags::RUN, self.run);
        flags.set(ControlFlags::FLY, self.fly);
        flags
    }
}

/// Capsule and motion tuning.
#[derive(Debug, Clone)]
pub struct AvatarConfig {
    pub mass: f32,
    pub radius: f32,
    pub height: f32,
    pub step_height: f32,
    pub gravity: f32,
    pub gravity_factor: f32,
    pub walk_speed: f32,
    pub run_speed: f32,
    pub fly_speed: f32,
    pub terminal_fall_speed: f32,
    pub jump_velocity: f32,
    pub jump_cooldown: Duration,
    pub max_jumps: u8,
    pub air_control: f32,
    pub ground_friction: f32,
    /// Per-tick blend toward an authoritative correction.
    pub reconcile_factor: f32,
    /// Positional error beyond which the correction snaps instead.
    pub snap_distance: f32,
    pub agent_update_interval: Duration,
    pub significant_position_delta: f32,
    pub significant_velocity_delta: f32,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            mass: 70.0,
            radius: 0.3,
            height: 1.8,
            step_height: 0.3,
            gravity: 9.81,
            gravity_factor: 1.0,
            walk_speed: 2.0,
            run_speed: 5.0,
            fly_speed: 10.0,
            terminal_fall_speed: 15.0,
            jump_velocity: 8.0,
            jump_cooldown: Duration::from_millis(500),
            max_jumps: 2,
            air_control: 0.3,
            ground_friction: 8.0,
            reconcile_factor: 0.1,
            snap_distance: 10.0,
            agent_update_interval: Duration::from_millis(50),
            significant_position_delta: 0.1,
            significant_velocity_delta: 0.5,
        }
    }
}

/// A nearby collider for the per-tick resolution pass.
#[derive(Debug, Clone, Copy)]
pub struct NearbyCollider {
    pub position: Vec3,
    pub radius: f32,
}

/// Snapshot of the last transmitted agent state.
#[derive(Debug, Clone, Copy)]
struct SentState {
    at: Instant,
    position: Vec3,
    velocity: Vec3,
    state: MovementState,
}

pub struct AvatarController {
    entity: EntityId,
    config: AvatarConfig,
    pub input: InputState,
    pub camera: CameraRig,
    position: Vec3,
    velocity: Vec3,
    yaw: f32,
    grounded: bool,
    jump_count: u8,
    last_jump_at: Option<Instant>,
    state: MovementState,
    sit_target: Option<Uuid>,
    correction: Option<Vec3>,
    last_sent: Option<SentState>,
}

impl AvatarController {
    /// Create the avatar entity with its full component set.
    pub fn spawn(store: &mut EntityStore, display_name: &str, config: AvatarConfig) -> Self {
        let entity = store.create();
        store.set_local_avatar(
            entity,
            LocalAvatar {
                display_name: display_name.to_string(),
                appearance: Uuid::nil(),
            },
        );
        store.set_position(entity, Position(Vec3::ZERO));
        store.set_rotation(entity, Rotation(Quat::IDENTITY));
        store.set_velocity(entity, Velocity(Vec3::ZERO));
        store.set_avatar_movement(entity, AvatarMovement::default());
        store.set_collision(
            entity,
            Collision {
                radius: config.radius,
                height: config.height,
                step_height: config.step_height,
                enabled: true,
            },
        );

        Self {
            entity,
            config,
            input: InputState::default(),
            camera: CameraRig::default(),
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            yaw: 0.0,
            grounded: true,
            jump_count: 0,
            last_jump_at: None,
            state: MovementState::Idle,
            sit_target: None,
            correction: None,
            last_sent: None,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn state(&self) -> MovementState {
        self.state
    }

    pub fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::KeyDown(key) => self.input.apply_key(key, true),
            InputEvent::KeyUp(key) => self.input.apply_key(key, false),
            InputEvent::MouseDelta { dx, dy } => {
                self.camera.apply_mouse(dx, dy);
                self.yaw = self.camera.yaw();
            }
            InputEvent::Gesture(GestureKind::DualTap) => self.input.jump_requested = true,
            InputEvent::Gesture(GestureKind::PointerMove) => self.input.forward = true,
        }
    }

    /// Place the avatar at an authoritative location immediately (region
    /// entry, teleport).
    pub fn teleport_to(&mut self, store: &mut EntityStore, position: Vec3, look_at: Vec3) {
        self.position = position;
        self.velocity = Vec3::ZERO;
        self.correction = None;
        if look_at.length_squared() > 0.0 {
            self.yaw = look_at.z.atan2(look_at.x);
            self.camera.set_yaw(self.yaw);
        }
        store.set_position(self.entity, Position(position));
        debug!(?position, "avatar teleported");
    }

    /// Blend toward an authoritative position from a remote correction.
    pub fn reconcile(&mut self, authoritative: Vec3) {
        if authoritative.distance(self.position) > self.config.snap_distance {
            // Too far to blend; treat as a teleport.
            self.position = authoritative;
            self.correction = None;
        } else {
            self.correction = Some(authoritative);
        }
    }

    pub fn sit_on(&mut self, target: Uuid) {
        self.sit_target = Some(target);
    }

    pub fn stand(&mut self) {
        self.sit_target = None;
    }

    /// One simulation tick.
    pub fn tick(
        &mut self,
        store: &mut EntityStore,
        dt: f32,
        ground_height: f32,
        colliders: &[NearbyCollider],
        now: Instant,
    ) {
        if self.sit_target.is_some() {
            self.velocity = Vec3::ZERO;
            self.state = MovementState::Sitting;
            self.write_back(store, now);
            return;
        }

        let wish = self.wish_direction();
        let flying = self.input.fly;

        if flying {
            let speed = self.config.fly_speed;
            let mut target = wish * speed;
            if self.input.up {
                target.y += speed;
            }
            if self.input.down {
                target.y -= speed;
            }
            // Flying has no gravity and tight control.
            self.velocity = self.velocity.lerp(target, (10.0 * dt).min(1.0));
            self.grounded = false;
        } else {
            let speed_cap = if self.input.run {
                self.config.run_speed
            } else {
                self.config.walk_speed
            };
            let control = if self.grounded { 1.0 } else { self.config.air_control };
            let target_horizontal = wish * speed_cap;
            let horizontal = Vec3::new(self.velocity.x, 0.0, self.velocity.z);
            let blended = horizontal.lerp(target_horizontal, (control * 10.0 * dt).min(1.0));
            self.velocity.x = blended.x;
            self.velocity.z = blended.z;

            if self.grounded && wish == Vec3::ZERO {
                // Ground friction decays residual horizontal velocity.
                let decay = (-self.config.ground_friction * dt).exp();
                self.velocity.x *= decay;
                self.velocity.z *= decay;
            }

            self.velocity.y -= self.config.gravity * self.config.gravity_factor * dt;
            self.velocity.y = self.velocity.y.max(-self.config.terminal_fall_speed);
        }

        if self.input.jump_requested {
            self.input.jump_requested = false;
            self.try_jump(now);
        }

        self.position += self.velocity * dt;
        self.resolve_ground(ground_height, now);
        self.resolve_colliders(colliders);
        self.apply_correction();

        self.state = self.derive_state();
        self.write_back(store, now);
    }

    fn wish_direction(&self) -> Vec3 {
        let forward = Vec3::new(self.yaw.cos(), 0.0, self.yaw.sin());
        let right = Vec3::new(-forward.z, 0.0, forward.x);
        let mut wish = Vec3::ZERO;
        if self.input.forward {
            wish += forward;
        }
        if self.input.backward {
            wish -= forward;
        }
        if self.input.strafe_right {
            wish += right;
        }
        if self.input.strafe_left {
            wish -= right;
        }
        if wish.length_squared() > 0.0 {
            wish.normalize()
        } else {
            Vec3::ZERO
        }
    }

    fn try_jump(&mut self, now: Instant) {
        if self.input.fly {
            return;
        }
        if let Some(last) = self.last_jump_at {
            if now.duration_since(last) < self.config.jump_cooldown {
                trace!("jump rejected: cooldown");
                return;
            }
        }
        if !self.grounded && self.jump_count >= self.config.max_jumps {
            trace!("jump rejected: airborne without a jump left");
            return;
        }
        self.velocity.y = self.config.jump_velocity;
        self.grounded = false;
        self.jump_count += 1;
        self.last_jump_at = Some(now);
    }

    fn resolve_ground(&mut self, ground_height: f32, _now: Instant) {
        if self.position.y <= ground_height {
            self.position.y = ground_height;
            if self.velocity.y < 0.0 {
                self.velocity.y = 0.0;
            }
            if !self.input.fly {
                self.grounded = true;
                self.jump_count = 0;
            }
        } else if self.position.y > ground_height + 0.01 && !self.input.fly {
            self.grounded = false;
        }
    }

    /// Push the capsule out of nearby colliders; the velocity component
    /// along each contact normal is zeroed.
    fn resolve_colliders(&mut self, colliders: &[NearbyCollider]) {
        for collider in colliders {
            let mut offset = self.position - collider.position;
            offset.y = 0.0;
            let min_distance = self.config.radius + collider.radius;
            let distance = offset.length();
            if distance >= min_distance || min_distance <= 0.0 {
                continue;
            }
            let normal = if distance > 1e-4 {
                offset / distance
            } else {
                Vec3::X
            };
            self.position += normal * (min_distance - distance);
            let along = self.velocity.dot(normal);
            if along < 0.0 {
                self.velocity -= normal * along;
            }
        }
    }

    fn apply_correction(&mut self) {
        if let Some(target) = self.correction {
            self.position = self.position.lerp(target, self.config.reconcile_factor);
            if self.position.distance(target) < 0.01 {
                self.position = target;
                self.correction = None;
            }
        }
    }

    fn derive_state(&self) -> MovementState {
        if self.sit_target.is_some() {
            return MovementState::Sitting;
        }
        if self.input.fly {
            return MovementState::Flying;
        }
        if !self.grounded {
            return if self.velocity.y > 0.5 {
                MovementState::Jumping
            } else {
                MovementState::Falling
            };
        }
        let horizontal_speed = Vec3::new(self.velocity.x, 0.0, self.velocity.z).length();
        if horizontal_speed > self.config.walk_speed + 0.25 {
            MovementState::Running
        } else if horizontal_speed > 0.25 {
            MovementState::Walking
        } else {
            MovementState::Idle
        }
    }

    fn write_back(&mut self, store: &mut EntityStore, now: Instant) {
        store.set_position(self.entity, Position(self.position));
        store.set_rotation(self.entity, Rotation(Quat::from_rotation_y(-self.yaw)));
        store.set_velocity(self.entity, Velocity(self.velocity));
        if let Some(movement) = store.avatar_movement_mut(self.entity) {
            movement.state = self.state;
            movement.grounded = self.grounded;
            movement.jump_count = self.jump_count;
            movement.is_flying = self.input.fly;
            movement.sit_target = self.sit_target;
            if self.grounded {
                movement.last_ground_at = now;
            }
        }
    }

    /// Build an outbound agent update when the send rate and the
    /// significant-change rules allow one.
    pub fn maybe_agent_update(
        &mut self,
        agent_id: Uuid,
        session_id: Uuid,
        now: Instant,
    ) -> Option<AgentUpdateData> {
        if let Some(sent) = self.last_sent {
            if now.duration_since(sent.at) < self.config.agent_update_interval {
                return None;
            }
            let moved = self.position.distance(sent.position) > self.config.significant_position_delta;
            let velocity_changed =
                (self.velocity - sent.velocity).length() > self.config.significant_velocity_delta;
            let state_changed = self.state != sent.state;
            if !moved && !velocity_changed && !state_changed {
                return None;
            }
        }

        self.last_sent = Some(SentState {
            at: now,
            position: self.position,
            velocity: self.velocity,
            state: self.state,
        });

        let view = self.camera.view(self.position, self.config.height);
        Some(AgentUpdateData {
            agent_id,
            session_id,
            body_rotation: Quat::from_rotation_y(-self.yaw),
            head_rotation: Quat::from_rotation_y(-self.yaw),
            state: self.state as u8,
            position: self.position,
            look_at: view.at_axis,
            up_axis: Vec3::Y,
            left_axis: view.left_axis,
            camera_center: view.center,
            camera_at_axis: view.at_axis,
            camera_left_axis: view.left_axis,
            camera_up_axis: view.up_axis,
            far: 256.0,
            aspect_ratio: 16.0 / 9.0,
            throttles: [0; 4],
            control_flags: self.input.control_flags().bits(),
            flags: 0,
        })
    }
}
