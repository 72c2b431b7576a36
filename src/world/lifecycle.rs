//! Object lifecycle: authoritative per-object metadata and the update
//! coalescer.
//!
//! Inbound object updates are queued on a min-heap keyed by a distance-
//! derived priority with FIFO ordering inside a band, then drained each
//! frame under a time budget so object churn cannot starve rendering.
//! The lifecycle manager owns the `localID -> metadata` map; the entity
//! store owns the components.

use crate::networking::messages::{
    CompressedObjectData, FullObjectData, PropertiesObjectData, TerseObjectData, TextureObjectData,
};
use crate::world::components::{
    AngularVelocity, Position, Rotation, Scale, SimObject, Velocity, Visual,
};
use crate::world::store::{EntityId, EntityStore};
use glam::Vec3;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Scheduling priority derived from distance to the local avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdatePriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Deferred = 4,
}

impl UpdatePriority {
    pub fn for_distance(distance: f32) -> Self {
        if distance < 10.0 {
            UpdatePriority::Critical
        } else if distance < 50.0 {
            UpdatePriority::High
        } else if distance < 100.0 {
            UpdatePriority::Normal
        } else if distance < 200.0 {
            UpdatePriority::Low
        } else {
            UpdatePriority::Deferred
        }
    }
}

/// One inbound object mutation, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingUpdate {
    Full(FullObjectData),
    Compressed(CompressedObjectData),
    Cached {
        local_id: u32,
        mesh_ref: Uuid,
        material_ref: Uuid,
        update_flags: u32,
    },
    Terse(TerseObjectData),
    Texture(TextureObjectData),
    Properties(PropertiesObjectData),
}

impl IncomingUpdate {
    pub fn local_id(&self) -> u32 {
        match self {
            IncomingUpdate::Full(d) => d.local_id,
            IncomingUpdate::Compressed(d) => d.data.local_id,
            IncomingUpdate::Cached { local_id, .. } => *local_id,
            IncomingUpdate::Terse(d) => d.local_id,
            IncomingUpdate::Texture(d) => d.local_id,
            IncomingUpdate::Properties(d) => d.local_id,
        }
    }

    fn position(&self) -> Option<Vec3> {
        match self {
            IncomingUpdate::Full(d) => Some(d.position),
            IncomingUpdate::Compressed(d) => Some(d.data.position),
            IncomingUpdate::Terse(d) => Some(d.position),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct QueuedUpdate {
    priority: UpdatePriority,
    seq: u64,
    update: IncomingUpdate,
}

impl PartialEq for QueuedUpdate {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedUpdate {}

impl PartialOrd for QueuedUpdate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedUpdate {
    // Inverted so the max-heap pops the lowest (priority, seq): highest
    // priority first, FIFO within a band.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Per-object bookkeeping owned by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub entity: EntityId,
    pub full_id: Uuid,
    pub last_update_at: Instant,
    pub update_seq: u64,
    pub last_position: Vec3,
    pub mesh_ref: Option<Uuid>,
    pub material_ref: Option<Uuid>,
    pub flags: u32,
    pub click_action: u8,
    pub name: String,
    pub description: String,
}

/// An asset lookup the core wants the external cache to perform.
/// Resolution is out-of-band; completions are patched in later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRequest {
    /// Keyed by a hash of the primitive parameters.
    Mesh { local_id: u32, mesh_ref: Uuid },
    /// Keyed by texture UUID.
    Texture { texture_ref: Uuid },
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Fraction of a frame the drain may consume.
    pub frame_budget_fraction: f32,
    /// Hard cap on updates applied per frame.
    pub per_frame_cap: usize,
    pub frame_duration: Duration,
    pub stale_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            frame_budget_fraction: 0.30,
            per_frame_cap: 20,
            frame_duration: Duration::from_micros(16_667),
            stale_timeout: Duration::from_secs(300),
        }
    }
}

pub struct ObjectLifecycle {
    config: LifecycleConfig,
    by_local: HashMap<u32, ObjectMeta>,
    queue: BinaryHeap<QueuedUpdate>,
    next_seq: u64,
    asset_requests: Vec<AssetRequest>,
}

impl ObjectLifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            by_local: HashMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
            asset_requests: Vec::new(),
        }
    }

    pub fn meta(&self, local_id: u32) -> Option<&ObjectMeta> {
        self.by_local.get(&local_id)
    }

    pub fn local_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_local.keys().copied()
    }

    pub fn tracked_count(&self) -> usize {
        self.by_local.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Take the asset lookups requested since the last drain.
    pub fn take_asset_requests(&mut self) -> Vec<AssetRequest> {
        std::mem::take(&mut self.asset_requests)
    }

    /// Queue an update, banded by distance from the avatar. Updates
    /// without a position fall back to the object's last known one.
    pub fn enqueue(&mut self, update: IncomingUpdate, avatar_position: Vec3) {
        let position = update
            .position()
            .or_else(|| self.by_local.get(&update.local_id()).map(|m| m.last_position));
        let priority = match position {
            Some(p) => UpdatePriority::for_distance(p.distance(avatar_position)),
            None => UpdatePriority::Deferred,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedUpdate {
            priority,
            seq,
            update,
        });
    }

    /// Drain queued updates within the frame budget. Returns the number
    /// applied.
    pub fn drain(&mut self, store: &mut EntityStore, now: Instant) -> usize {
        let budget = self.config.frame_duration.mul_f32(self.config.frame_budget_fraction);
        let started = Instant::now();
        let mut applied = 0;

        while applied < self.config.per_frame_cap {
            if applied > 0 && started.elapsed() >= budget {
                trace!(applied, "frame budget exhausted");
                break;
            }
            let Some(queued) = self.queue.pop() else {
                break;
            };
            self.apply(store, queued.update, now);
            applied += 1;
        }

        applied
    }

    /// Apply one update immediately, bypassing the queue.
    pub fn apply(&mut self, store: &mut EntityStore, update: IncomingUpdate, now: Instant) {
        match update {
            IncomingUpdate::Full(data) => self.apply_full(store, data, now),
            IncomingUpdate::Compressed(data) => self.apply_full(store, data.data, now),
            IncomingUpdate::Cached {
                local_id,
                mesh_ref,
                material_ref,
                ..
            } => self.apply_cached(store, local_id, mesh_ref, material_ref, now),
            IncomingUpdate::Terse(data) => self.apply_terse(store, data, now),
            IncomingUpdate::Texture(data) => self.apply_texture(store, data, now),
            IncomingUpdate::Properties(data) => self.apply_properties(data, now),
        }
    }

    fn touch(&mut self, store: &mut EntityStore, local_id: u32, now: Instant) {
        if let Some(meta) = self.by_local.get_mut(&local_id) {
            meta.last_update_at = now;
            meta.update_seq += 1;
            if let Some(object) = store.sim_object_mut(meta.entity) {
                object.last_update_at = now;
                object.update_seq = meta.update_seq;
            }
        }
    }

    fn apply_full(&mut self, store: &mut EntityStore, data: FullObjectData, now: Instant) {
        match self.by_local.get(&data.local_id).map(|meta| meta.entity) {
            None => self.create_object(store, data, now),
            Some(entity) => self.diff_full(store, entity, data, now),
        }
    }

    fn create_object(&mut self, store: &mut EntityStore, data: FullObjectData, now: Instant) {
        let entity = store.create();
        store.set_sim_object(
            entity,
            SimObject {
                local_id: data.local_id,
                full_id: data.full_id,
                owner_id: data.owner_id,
                group_id: data.group_id,
                parent_local_id: data.parent_local_id,
                last_update_at: now,
                update_seq: 0,
            },
        );
        store.set_position(entity, Position(data.position));
        store.set_rotation(entity, Rotation(data.rotation));
        store.set_scale(entity, Scale(data.scale));
        store.set_velocity(entity, Velocity(data.velocity));
        store.set_angular_velocity(entity, AngularVelocity(data.angular_velocity));

        let mesh_ref = (!data.mesh_ref.is_nil()).then_some(data.mesh_ref);
        let material_ref = (!data.material_ref.is_nil()).then_some(data.material_ref);
        store.set_visual(
            entity,
            Visual {
                kind: data.kind.into(),
                base_color: data.base_color,
                material_ref,
                mesh_ref,
            },
        );

        if let Some(mesh_ref) = mesh_ref {
            self.asset_requests.push(AssetRequest::Mesh {
                local_id: data.local_id,
                mesh_ref,
            });
        }
        if let Some(texture_ref) = material_ref {
            self.asset_requests.push(AssetRequest::Texture { texture_ref });
        }

        self.by_local.insert(
            data.local_id,
            ObjectMeta {
                entity,
                full_id: data.full_id,
                last_update_at: now,
                update_seq: 0,
                last_position: data.position,
                mesh_ref,
                material_ref,
                flags: data.flags,
                click_action: data.click_action,
                name: data.name,
                description: data.description,
            },
        );
        debug!(local_id = data.local_id, "object created");
    }

    /// Diff an inbound full record against current state and apply only
    /// the changed classes.
    fn diff_full(&mut self, store: &mut EntityStore, entity: EntityId, data: FullObjectData, now: Instant) {
        let transform_changed = store.position(entity).map(|p| p.0) != Some(data.position)
            || store.rotation(entity).map(|r| r.0) != Some(data.rotation)
            || store.scale(entity).map(|s| s.0) != Some(data.scale)
            || store.velocity(entity).map(|v| v.0) != Some(data.velocity)
            || store.angular_velocity(entity).map(|v| v.0) != Some(data.angular_velocity);
        if transform_changed {
            store.set_position(entity, Position(data.position));
            store.set_rotation(entity, Rotation(data.rotation));
            store.set_scale(entity, Scale(data.scale));
            store.set_velocity(entity, Velocity(data.velocity));
            store.set_angular_velocity(entity, AngularVelocity(data.angular_velocity));
        }

        let mesh_ref = (!data.mesh_ref.is_nil()).then_some(data.mesh_ref);
        let material_ref = (!data.material_ref.is_nil()).then_some(data.material_ref);
        if let Some(current) = store.visual(entity).cloned() {
            let visual_changed = current.kind != data.kind.into() || current.mesh_ref != mesh_ref;
            let material_changed =
                current.base_color != data.base_color || current.material_ref != material_ref;
            let next = Visual {
                kind: data.kind.into(),
                base_color: data.base_color,
                material_ref,
                mesh_ref,
            };
            if visual_changed {
                store.set_visual(entity, next);
            } else if material_changed {
                store.set_visual_material(entity, next);
            }
        }

        if let Some(meta) = self.by_local.get_mut(&data.local_id) {
            meta.last_position = data.position;
            meta.mesh_ref = mesh_ref;
            meta.material_ref = material_ref;
            meta.flags = data.flags;
            meta.click_action = data.click_action;
            meta.name = data.name;
            meta.description = data.description;
        }
        self.touch(store, data.local_id, now);
    }

    fn apply_terse(&mut self, store: &mut EntityStore, data: TerseObjectData, now: Instant) {
        let Some(meta) = self.by_local.get_mut(&data.local_id) else {
            // Terse before full: nothing to attach it to yet.
            trace!(local_id = data.local_id, "terse update for unknown object");
            return;
        };
        let entity = meta.entity;
        meta.last_position = data.position;

        store.set_position(entity, Position(data.position));
        store.set_rotation(entity, Rotation(data.rotation));
        store.set_velocity(entity, Velocity(data.velocity));
        store.set_angular_velocity(entity, AngularVelocity(data.angular_velocity));
        self.touch(store, data.local_id, now);
    }

    fn apply_texture(&mut self, store: &mut EntityStore, data: TextureObjectData, now: Instant) {
        let Some(meta) = self.by_local.get_mut(&data.local_id) else {
            return;
        };
        let entity = meta.entity;
        let material_ref = (!data.material_ref.is_nil()).then_some(data.material_ref);
        meta.material_ref = material_ref;

        if let Some(current) = store.visual(entity).cloned() {
            store.set_visual_material(
                entity,
                Visual {
                    base_color: data.base_color,
                    material_ref,
                    ..current
                },
            );
        }
        if let Some(texture_ref) = material_ref {
            self.asset_requests.push(AssetRequest::Texture { texture_ref });
        }
        self.touch(store, data.local_id, now);
    }

    fn apply_properties(&mut self, data: PropertiesObjectData, now: Instant) {
        if let Some(meta) = self.by_local.get_mut(&data.local_id) {
            meta.flags = data.flags;
            meta.click_action = data.click_action;
            meta.name = data.name;
            meta.description = data.description;
            meta.last_update_at = now;
            meta.update_seq += 1;
        }
    }

    fn apply_cached(
        &mut self,
        store: &mut EntityStore,
        local_id: u32,
        mesh_ref: Uuid,
        material_ref: Uuid,
        now: Instant,
    ) {
        let Some(meta) = self.by_local.get_mut(&local_id) else {
            return;
        };
        let entity = meta.entity;
        meta.mesh_ref = (!mesh_ref.is_nil()).then_some(mesh_ref);
        meta.material_ref = (!material_ref.is_nil()).then_some(material_ref);

        if let Some(current) = store.visual(entity).cloned() {
            store.set_visual(
                entity,
                Visual {
                    mesh_ref: meta.mesh_ref,
                    material_ref: meta.material_ref,
                    ..current
                },
            );
        }
        if let Some(mesh_ref) = meta.mesh_ref {
            self.asset_requests.push(AssetRequest::Mesh { local_id, mesh_ref });
        }
        self.touch(store, local_id, now);
    }

    /// Patch a completed mesh resolution into the object's visual and
    /// re-notify observers.
    pub fn complete_mesh_resolution(&mut self, store: &mut EntityStore, local_id: u32, mesh_ref: Uuid) {
        let Some(meta) = self.by_local.get_mut(&local_id) else {
            return;
        };
        meta.mesh_ref = Some(mesh_ref);
        let entity = meta.entity;
        if let Some(current) = store.visual(entity).cloned() {
            store.set_visual(
                entity,
                Visual {
                    mesh_ref: Some(mesh_ref),
                    ..current
                },
            );
        }
    }

    /// Patch a completed texture resolution into every visual that
    /// references it.
    pub fn complete_texture_resolution(&mut self, store: &mut EntityStore, texture_ref: Uuid) {
        let entities: Vec<EntityId> = store
            .iter_visuals()
            .filter(|(_, v)| v.material_ref == Some(texture_ref))
            .map(|(e, _)| e)
            .collect();
        for entity in entities {
            if let Some(current) = store.visual(entity).cloned() {
                store.set_visual_material(entity, current);
            }
        }
    }

    /// Remove objects by local id (inbound kill or cleanup decision).
    pub fn kill(&mut self, store: &mut EntityStore, local_ids: &[u32]) {
        for local_id in local_ids {
            match self.by_local.remove(local_id) {
                Some(meta) => {
                    store.destroy(meta.entity);
                    debug!(local_id, "object killed");
                }
                None => warn!(local_id, "kill for untracked object"),
            }
        }
    }

    /// Drop every tracked object: the circuit that owned them is gone.
    pub fn clear_all(&mut self, store: &mut EntityStore) {
        let count = self.by_local.len();
        for (_, meta) in self.by_local.drain() {
            store.destroy(meta.entity);
        }
        self.queue.clear();
        self.asset_requests.clear();
        if count > 0 {
            debug!(count, "all objects cleared");
        }
    }

    /// Objects with no update for longer than the stale timeout.
    pub fn stale_objects(&self, now: Instant) -> Vec<u32> {
        self.by_local
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.last_update_at) > self.config.stale_timeout)
            .map(|(local_id, _)| *local_id)
            .collect()
    }

    /// Metadata entries whose entity no longer exists in the store.
    pub fn orphaned_metadata(&self, store: &EntityStore) -> Vec<u32> {
        self.by_local
            .iter()
            .filter(|(_, meta)| !store.contains(meta.entity))
            .map(|(local_id, _)| *local_id)
            .collect()
    }

    /// Forget a metadata entry without touching the store. Used when the
    /// entity is already gone.
    pub fn forget(&mut self, local_id: u32) {
        self.by_local.remove(&local_id);
    }
}
