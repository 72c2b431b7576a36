//! Render bridge: projects entity-store changes onto an external
//! renderer.
//!
//! The bridge owns no components. It keeps a map of entities it has
//! announced, translates change batches into sink calls, and can
//! rebuild the sink's view from scratch after a resynchronization.

use crate::world::components::{Physics, Visual, VisualKind};
use crate::world::store::{ChangeClass, ChangeEvent, EntityId, EntityStore};
use glam::{Quat, Vec3};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Transform snapshot handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

/// The external renderer. Implementations live outside the core; the
/// bridge only pushes notifications and never reads back.
pub trait RenderSink: Send {
    fn entity_created(&mut self, handle: EntityId, kind: VisualKind, transform: Transform, visual: &Visual);
    fn entity_destroyed(&mut self, handle: EntityId);
    fn entity_transform_changed(&mut self, handle: EntityId, transform: Transform);
    fn entity_material_changed(&mut self, handle: EntityId, visual: &Visual);
    fn entity_physics_changed(&mut self, handle: EntityId, physics: Option<&Physics>);

    /// Anchors carry ephemeral overlays (chat bubbles) at a world
    /// position.
    fn add_anchor(&mut self, world_position: Vec3) -> u64;
    fn remove_anchor(&mut self, anchor: u64);
}

/// Sink that discards everything. Used headless.
#[derive(Debug, Default)]
pub struct NullSink {
    next_anchor: u64,
}

impl RenderSink for NullSink {
    fn entity_created(&mut self, _: EntityId, _: VisualKind, _: Transform, _: &Visual) {}
    fn entity_destroyed(&mut self, _: EntityId) {}
    fn entity_transform_changed(&mut self, _: EntityId, _: Transform) {}
    fn entity_material_changed(&mut self, _: EntityId, _: &Visual) {}
    fn entity_physics_changed(&mut self, _: EntityId, _: Option<&Physics>) {}

    fn add_anchor(&mut self, _: Vec3) -> u64 {
        self.next_anchor += 1;
        self.next_anchor
    }

    fn remove_anchor(&mut self, _: u64) {}
}

fn transform_of(store: &EntityStore, entity: EntityId) -> Transform {
    Transform {
        position: store.position(entity).map(|p| p.0).unwrap_or(Vec3::ZERO),
        rotation: store.rotation(entity).map(|r| r.0).unwrap_or(Quat::IDENTITY),
        scale: store.scale(entity).map(|s| s.0).unwrap_or(Vec3::ONE),
    }
}

/// Per-entity state the bridge remembers about the sink's view.
#[derive(Debug, Clone, Copy)]
struct RenderEntry {
    has_collider: bool,
}

pub struct RenderBridge {
    sink: Box<dyn RenderSink>,
    known: HashMap<EntityId, RenderEntry>,
}

impl RenderBridge {
    pub fn new(sink: Box<dyn RenderSink>) -> Self {
        Self {
            sink,
            known: HashMap::new(),
        }
    }

    /// Entities currently announced to the renderer.
    pub fn known_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.known.keys().copied()
    }

    pub fn knows(&self, entity: EntityId) -> bool {
        self.known.contains_key(&entity)
    }

    pub fn sink_mut(&mut self) -> &mut dyn RenderSink {
        self.sink.as_mut()
    }

    /// Apply one flushed change batch.
    pub fn apply(&mut self, store: &EntityStore, events: &[ChangeEvent]) {
        for event in events {
            match event.class {
                ChangeClass::Structure => {
                    if store.contains(event.entity) {
                        self.announce(store, event.entity);
                    } else {
                        self.retract(event.entity);
                    }
                }
                ChangeClass::Transform => {
                    if self.knows(event.entity) && store.contains(event.entity) {
                        self.sink
                            .entity_transform_changed(event.entity, transform_of(store, event.entity));
                    }
                }
                ChangeClass::Visual | ChangeClass::Material => {
                    if !self.knows(event.entity) || !store.contains(event.entity) {
                        continue;
                    }
                    if let Some(visual) = store.visual(event.entity) {
                        self.sink.entity_material_changed(event.entity, visual);
                    }
                }
                ChangeClass::Physics => {
                    if !self.knows(event.entity) || !store.contains(event.entity) {
                        continue;
                    }
                    let physics = store.physics_of(event.entity);
                    self.sink.entity_physics_changed(event.entity, physics);
                    if let Some(entry) = self.known.get_mut(&event.entity) {
                        entry.has_collider = physics.is_some();
                    }
                }
            }
        }
    }

    fn announce(&mut self, store: &EntityStore, entity: EntityId) {
        if self.knows(entity) {
            return;
        }
        // Only entities with a visual are renderable; bookkeeping-only
        // entities stay invisible.
        let Some(visual) = store.visual(entity) else {
            return;
        };
        self.sink
            .entity_created(entity, visual.kind, transform_of(store, entity), visual);
        let physics = store.physics_of(entity);
        if physics.is_some() {
            self.sink.entity_physics_changed(entity, physics);
        }
        self.known.insert(
            entity,
            RenderEntry {
                has_collider: physics.is_some(),
            },
        );
        trace!(entity = entity.raw(), "announced to renderer");
    }

    fn retract(&mut self, entity: EntityId) {
        if self.known.remove(&entity).is_some() {
            self.sink.entity_destroyed(entity);
            trace!(entity = entity.raw(), "retracted from renderer");
        }
    }

    /// Rebuild the renderer view from the store: retract everything,
    /// then announce every renderable entity currently alive.
    pub fn force_resync(&mut self, store: &EntityStore) {
        debug!(known = self.known.len(), "render bridge resync");
        let stale: Vec<EntityId> = self.known.keys().copied().collect();
        for entity in stale {
            self.retract(entity);
        }
        let renderable: Vec<EntityId> = store.iter_visuals().map(|(e, _)| e).collect();
        for entity in renderable {
            self.announce(store, entity);
        }
    }
}

/// Recording sink for tests: remembers every call in order.
#[cfg(test)]
pub mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkCall {
        Created(EntityId),
        Destroyed(EntityId),
        Transform(EntityId, Vec3),
        Material(EntityId),
        Physics(EntityId, bool),
        AnchorAdded(u64, Vec3),
        AnchorRemoved(u64),
    }

    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub calls: std::sync::Arc<std::sync::Mutex<Vec<SinkCall>>>,
        next_anchor: u64,
    }

    impl RecordingSink {
        pub fn new() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<SinkCall>>>) {
            let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
            (
                Self {
                    calls: std::sync::Arc::clone(&calls),
                    next_anchor: 0,
                },
                calls,
            )
        }
    }

    impl RenderSink for RecordingSink {
        fn entity_created(&mut self, handle: EntityId, _: VisualKind, _: Transform, _: &Visual) {
            self.calls.lock().unwrap().push(SinkCall::Created(handle));
        }

        fn entity_destroyed(&mut self, handle: EntityId) {
            self.calls.lock().unwrap().push(SinkCall::Destroyed(handle));
        }

        fn entity_transform_changed(&mut self, handle: EntityId, transform: Transform) {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::Transform(handle, transform.position));
        }

        fn entity_material_changed(&mut self, handle: EntityId, _: &Visual) {
            self.calls.lock().unwrap().push(SinkCall::Material(handle));
        }

        fn entity_physics_changed(&mut self, handle: EntityId, physics: Option<&Physics>) {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::Physics(handle, physics.is_some()));
        }

        fn add_anchor(&mut self, world_position: Vec3) -> u64 {
            self.next_anchor += 1;
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::AnchorAdded(self.next_anchor, world_position));
            self.next_anchor
        }

        fn remove_anchor(&mut self, anchor: u64) {
            self.calls.lock().unwrap().push(SinkCall::AnchorRemoved(anchor));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSink, SinkCall};
    use super::*;
    use crate::world::components::{Position, Visual};

    fn renderable(store: &mut EntityStore) -> EntityId {
        let e = store.create();
        store.set_position(e, Position(Vec3::new(1.0, 2.0, 3.0)));
        store.set_visual(e, Visual::default());
        e
    }

    #[test]
    fn test_create_update_destroy_flow() {
        let mut store = EntityStore::new();
        let (sink, calls) = RecordingSink::new();
        let mut bridge = RenderBridge::new(Box::new(sink));

        let e = renderable(&mut store);
        let batch = store.flush_events();
        bridge.apply(&store, &batch);

        store.set_position(e, Position(Vec3::new(4.0, 5.0, 6.0)));
        let batch = store.flush_events();
        bridge.apply(&store, &batch);

        store.destroy(e);
        let batch = store.flush_events();
        bridge.apply(&store, &batch);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0], SinkCall::Created(e));
        assert_eq!(calls[1], SinkCall::Transform(e, Vec3::new(4.0, 5.0, 6.0)));
        assert_eq!(calls[2], SinkCall::Destroyed(e));
    }

    #[test]
    fn test_bridge_only_tracks_store_entities() {
        let mut store = EntityStore::new();
        let (sink, _) = RecordingSink::new();
        let mut bridge = RenderBridge::new(Box::new(sink));

        let e = renderable(&mut store);
        let events = store.flush_events();
        bridge.apply(&store, &events);
        assert!(bridge.knows(e));

        // Every known entity exists in the store.
        for known in bridge.known_entities() {
            assert!(store.contains(known));
        }
    }

    #[test]
    fn test_entity_without_visual_not_announced() {
        let mut store = EntityStore::new();
        let (sink, calls) = RecordingSink::new();
        let mut bridge = RenderBridge::new(Box::new(sink));

        let e = store.create();
        store.set_position(e, Position(Vec3::ZERO));
        let events = store.flush_events();
        bridge.apply(&store, &events);

        assert!(!bridge.knows(e));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_force_resync_rebuilds_view() {
        let mut store = EntityStore::new();
        let (sink, calls) = RecordingSink::new();
        let mut bridge = RenderBridge::new(Box::new(sink));

        let a = renderable(&mut store);
        let b = renderable(&mut store);
        let events = store.flush_events();
        bridge.apply(&store, &events);
        calls.lock().unwrap().clear();

        bridge.force_resync(&store);
        let calls = calls.lock().unwrap();
        let destroys: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, SinkCall::Destroyed(_)))
            .collect();
        let creates: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, SinkCall::Created(_)))
            .collect();
        assert_eq!(destroys.len(), 2);
        assert_eq!(creates.len(), 2);
        assert!(bridge.knows(a) && bridge.knows(b));
    }
}
