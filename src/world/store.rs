//! Entity store: dense per-component storage with batched change events.
//!
//! Entities are generational handles; components live in dense columns
//! with a sparse index for O(1) lookup and O(k) iteration over the k
//! entities that carry a component. All mutation happens on the sim
//! thread; observers receive change batches only after a flush, so the
//! components written for one entity within a frame appear atomic.

use crate::world::components::*;
use std::collections::HashMap;
use tracing::trace;

/// Opaque 64-bit entity handle: generation in the high half, slot index
/// in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Change classification carried by every notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeClass {
    Transform,
    Visual,
    Material,
    Physics,
    Structure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub entity: EntityId,
    pub class: ChangeClass,
}

/// Dense column of one component type.
struct ComponentColumn<T> {
    dense: Vec<(EntityId, T)>,
    sparse: HashMap<EntityId, usize>,
}

impl<T> ComponentColumn<T> {
    fn new() -> Self {
        Self {
            dense: Vec::new(),
            sparse: HashMap::new(),
        }
    }

    fn get(&self, entity: EntityId) -> Option<&T> {
        self.sparse.get(&entity).map(|&i| &self.dense[i].1)
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        let index = *self.sparse.get(&entity)?;
        Some(&mut self.dense[index].1)
    }

    fn insert(&mut self, entity: EntityId, value: T) {
        match self.sparse.get(&entity) {
            Some(&i) => self.dense[i].1 = value,
            None => {
                self.sparse.insert(entity, self.dense.len());
                self.dense.push((entity, value));
            }
        }
    }

    fn remove(&mut self, entity: EntityId) -> Option<T> {
        let index = self.sparse.remove(&entity)?;
        let (_, value) = self.dense.swap_remove(index);
        if index < self.dense.len() {
            let moved = self.dense[index].0;
            self.sparse.insert(moved, index);
        }
        Some(value)
    }

    fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.dense.iter().map(|(e, v)| (*e, v))
    }

    fn len(&self) -> usize {
        self.dense.len()
    }
}

macro_rules! column_accessors {
    ($field:ident, $ty:ty, $get:ident, $set:ident, $remove:ident, $iter:ident, $class:expr) => {
        pub fn $get(&self, entity: EntityId) -> Option<&$ty> {
            self.$field.get(entity)
        }

        pub fn $set(&mut self, entity: EntityId, value: $ty) {
            if !self.contains(entity) {
                return;
            }
            self.$field.insert(entity, value);
            let class: Option<ChangeClass> = $class;
            if let Some(class) = class {
                self.mark(entity, class);
            }
        }

        pub fn $remove(&mut self, entity: EntityId) -> Option<$ty> {
            let removed = self.$field.remove(entity);
            if removed.is_some() {
                let class: Option<ChangeClass> = $class;
                if let Some(class) = class {
                    self.mark(entity, class);
                }
            }
            removed
        }

        pub fn $iter(&self) -> impl Iterator<Item = (EntityId, &$ty)> {
            self.$field.iter()
        }
    };
}

/// The store itself. The sim thread is the only writer.
pub struct EntityStore {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: Vec<u32>,
    live_count: usize,

    positions: ComponentColumn<Position>,
    rotations: ComponentColumn<Rotation>,
    scales: ComponentColumn<Scale>,
    velocities: ComponentColumn<Velocity>,
    angular_velocities: ComponentColumn<AngularVelocity>,
    sim_objects: ComponentColumn<SimObject>,
    visuals: ComponentColumn<Visual>,
    physics: ComponentColumn<Physics>,
    local_avatars: ComponentColumn<LocalAvatar>,
    avatar_movements: ComponentColumn<AvatarMovement>,
    collisions: ComponentColumn<Collision>,
    region_boundaries: ComponentColumn<RegionBoundary>,
    chat_bubbles: ComponentColumn<ChatBubble>,

    pending: Vec<ChangeEvent>,
    subscribers: Vec<crossbeam_channel::Sender<Vec<ChangeEvent>>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            generations: Vec::new(),
            alive: Vec::new(),
            free: Vec::new(),
            live_count: 0,
            positions: ComponentColumn::new(),
            rotations: ComponentColumn::new(),
            scales: ComponentColumn::new(),
            velocities: ComponentColumn::new(),
            angular_velocities: ComponentColumn::new(),
            sim_objects: ComponentColumn::new(),
            visuals: ComponentColumn::new(),
            physics: ComponentColumn::new(),
            local_avatars: ComponentColumn::new(),
            avatar_movements: ComponentColumn::new(),
            collisions: ComponentColumn::new(),
            region_boundaries: ComponentColumn::new(),
            chat_bubbles: ComponentColumn::new(),
            pending: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn create(&mut self) -> EntityId {
        let entity = match self.free.pop() {
            Some(index) => {
                self.alive[index as usize] = true;
                EntityId::new(index, self.generations[index as usize])
            }
            None => {
                let index = self.generations.len() as u32;
                self.generations.push(0);
                self.alive.push(true);
                EntityId::new(index, 0)
            }
        };
        self.live_count += 1;
        self.mark(entity, ChangeClass::Structure);
        trace!(entity = entity.raw(), "entity created");
        entity
    }

    /// Destroy an entity and all of its components. The structure event
    /// is emitted with the entity already gone, so observers resolve it
    /// as a removal.
    pub fn destroy(&mut self, entity: EntityId) {
        if !self.contains(entity) {
            return;
        }
        self.positions.remove(entity);
        self.rotations.remove(entity);
        self.scales.remove(entity);
        self.velocities.remove(entity);
        self.angular_velocities.remove(entity);
        self.sim_objects.remove(entity);
        self.visuals.remove(entity);
        self.physics.remove(entity);
        self.local_avatars.remove(entity);
        self.avatar_movements.remove(entity);
        self.collisions.remove(entity);
        self.region_boundaries.remove(entity);
        self.chat_bubbles.remove(entity);

        let index = entity.index() as usize;
        self.alive[index] = false;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free.push(entity.index());
        self.live_count -= 1;
        self.mark(entity, ChangeClass::Structure);
        trace!(entity = entity.raw(), "entity destroyed");
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        let index = entity.index() as usize;
        index < self.alive.len()
            && self.alive[index]
            && self.generations[index] == entity.generation()
    }

    pub fn entity_count(&self) -> usize {
        self.live_count
    }

    /// All live entity handles.
    pub fn iter_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(index, _)| EntityId::new(index as u32, self.generations[index]))
    }

    /// Record a change for the next flush. Explicit marking is used by
    /// callers that classify a mutation themselves (e.g. a material-only
    /// visual change).
    pub fn mark(&mut self, entity: EntityId, class: ChangeClass) {
        self.pending.push(ChangeEvent { entity, class });
    }

    /// Subscribe to flushed change batches.
    pub fn subscribe(&mut self) -> crossbeam_channel::Receiver<Vec<ChangeEvent>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Publish the pending batch: one event per (entity, class) pair,
    /// first-occurrence order preserved.
    pub fn flush_events(&mut self) -> Vec<ChangeEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let mut seen = std::collections::HashSet::new();
        let mut batch = Vec::with_capacity(self.pending.len());
        for event in self.pending.drain(..) {
            if seen.insert((event.entity, event.class)) {
                batch.push(event);
            }
        }
        self.subscribers
            .retain(|tx| tx.send(batch.clone()).is_ok());
        batch
    }

    column_accessors!(positions, Position, position, set_position, remove_position, iter_positions, Some(ChangeClass::Transform));
    column_accessors!(rotations, Rotation, rotation, set_rotation, remove_rotation, iter_rotations, Some(ChangeClass::Transform));
    column_accessors!(scales, Scale, scale, set_scale, remove_scale, iter_scales, Some(ChangeClass::Transform));
    column_accessors!(velocities, Velocity, velocity, set_velocity, remove_velocity, iter_velocities, Some(ChangeClass::Transform));
    column_accessors!(angular_velocities, AngularVelocity, angular_velocity, set_angular_velocity, remove_angular_velocity, iter_angular_velocities, Some(ChangeClass::Transform));
    column_accessors!(sim_objects, SimObject, sim_object, set_sim_object, remove_sim_object, iter_sim_objects, None);
    column_accessors!(visuals, Visual, visual, set_visual, remove_visual, iter_visuals, Some(ChangeClass::Visual));
    column_accessors!(physics, Physics, physics_of, set_physics, remove_physics, iter_physics, Some(ChangeClass::Physics));
    column_accessors!(local_avatars, LocalAvatar, local_avatar, set_local_avatar, remove_local_avatar, iter_local_avatars, None);
    column_accessors!(avatar_movements, AvatarMovement, avatar_movement, set_avatar_movement, remove_avatar_movement, iter_avatar_movements, None);
    column_accessors!(collisions, Collision, collision, set_collision, remove_collision, iter_collisions, None);
    column_accessors!(region_boundaries, RegionBoundary, region_boundary, set_region_boundary, remove_region_boundary, iter_region_boundaries, None);
    column_accessors!(chat_bubbles, ChatBubble, chat_bubble, set_chat_bubble, remove_chat_bubble, iter_chat_bubbles, None);

    /// Replace a visual where only material fields changed; observers
    /// see a material event rather than a full visual rebind.
    pub fn set_visual_material(&mut self, entity: EntityId, visual: Visual) {
        if !self.contains(entity) {
            return;
        }
        self.visuals.insert(entity, visual);
        self.mark(entity, ChangeClass::Material);
    }

    /// In-place update of bookkeeping fields that emit no event.
    pub fn sim_object_mut(&mut self, entity: EntityId) -> Option<&mut SimObject> {
        self.sim_objects.get_mut(entity)
    }

    pub fn avatar_movement_mut(&mut self, entity: EntityId) -> Option<&mut AvatarMovement> {
        self.avatar_movements.get_mut(entity)
    }

    pub fn sim_object_count(&self) -> usize {
        self.sim_objects.len()
    }

    /// The local avatar entity, if one exists.
    pub fn avatar_entity(&self) -> Option<EntityId> {
        self.local_avatars.iter().map(|(e, _)| e).next()
    }

    /// Find a sim object by its per-region local identifier.
    pub fn find_by_local_id(&self, local_id: u32) -> Option<EntityId> {
        self.sim_objects
            .iter()
            .find(|(_, o)| o.local_id == local_id)
            .map(|(e, _)| e)
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
