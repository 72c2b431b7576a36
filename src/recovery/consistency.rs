//! Consistency checker: a periodic cross-pass over the entity store,
//! the lifecycle metadata, and the render bridge.
//!
//! Each finding maps to a cleanup operation; corrupted state escalates
//! to a full resynchronization. A SHA-256 fingerprint over a canonical
//! byte walk of the store backs cheap change detection between passes.

use crate::recovery::cleanup::{CleanupKind, CleanupOp, CleanupTarget};
use crate::world::lifecycle::ObjectLifecycle;
use crate::world::render::RenderBridge;
use crate::world::store::{EntityId, EntityStore};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, warn};

/// One detected invariant violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// Entity carries a `SimObject` but the lifecycle has no record.
    OrphanedEntity(EntityId),
    /// Lifecycle record whose entity no longer exists.
    OrphanedSimObject(u32),
    /// Render bridge knows an entity the store does not contain.
    OrphanedRender(EntityId),
    /// Entity with no identifying component at all.
    MemoryLeak(EntityId),
    /// An invariant the cleanup queue cannot repair piecemeal.
    CorruptedState(String),
}

impl Inconsistency {
    /// The cleanup that repairs this finding, if one exists.
    /// `CorruptedState` has none: it escalates to full resync.
    pub fn cleanup_op(&self) -> Option<CleanupOp> {
        match self {
            Inconsistency::OrphanedEntity(entity) => Some(CleanupOp::new(
                CleanupKind::Orphaned,
                CleanupTarget::Entity(*entity),
                "sim object without lifecycle record",
            )),
            Inconsistency::OrphanedSimObject(local_id) => Some(CleanupOp::new(
                CleanupKind::Orphaned,
                CleanupTarget::LocalId(*local_id),
                "lifecycle record without entity",
            )),
            Inconsistency::OrphanedRender(entity) => Some(CleanupOp::new(
                CleanupKind::Cascade,
                CleanupTarget::Entity(*entity),
                "render entry without entity",
            )),
            Inconsistency::MemoryLeak(entity) => Some(CleanupOp::new(
                CleanupKind::Forced,
                CleanupTarget::Entity(*entity),
                "component-less entity",
            )),
            Inconsistency::CorruptedState(_) => None,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Inconsistency::CorruptedState(_))
    }
}

#[derive(Debug, Default)]
pub struct ConsistencyChecker {
    last_fingerprint: Option<[u8; 32]>,
    pub passes: u64,
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one cross-pass.
    pub fn check(
        &mut self,
        store: &EntityStore,
        lifecycle: &ObjectLifecycle,
        bridge: &RenderBridge,
    ) -> Vec<Inconsistency> {
        self.passes += 1;
        let mut findings = Vec::new();

        // SimObject entities must have lifecycle records, unique local
        // ids, and the required component set.
        let mut seen_locals: HashSet<u32> = HashSet::new();
        for (entity, object) in store.iter_sim_objects() {
            if !seen_locals.insert(object.local_id) {
                findings.push(Inconsistency::CorruptedState(format!(
                    "duplicate local id {}",
                    object.local_id
                )));
            }
            if lifecycle.meta(object.local_id).map(|m| m.entity) != Some(entity) {
                findings.push(Inconsistency::OrphanedEntity(entity));
            }
            let complete = store.position(entity).is_some()
                && store.rotation(entity).is_some()
                && store.scale(entity).is_some()
                && store.visual(entity).is_some();
            if !complete {
                findings.push(Inconsistency::CorruptedState(format!(
                    "sim object {} missing required components",
                    object.local_id
                )));
            }
        }

        // Lifecycle records must point at live entities.
        for local_id in lifecycle.orphaned_metadata(store) {
            findings.push(Inconsistency::OrphanedSimObject(local_id));
        }

        // The bridge may only know live entities.
        for entity in bridge.known_entities() {
            if !store.contains(entity) {
                findings.push(Inconsistency::OrphanedRender(entity));
            }
        }

        // Entities with no identifying component are leaked bookkeeping.
        for entity in store.iter_entities() {
            let anchored = store.sim_object(entity).is_some()
                || store.local_avatar(entity).is_some()
                || store.chat_bubble(entity).is_some()
                || store.region_boundary(entity).is_some()
                || store.visual(entity).is_some();
            if !anchored {
                findings.push(Inconsistency::MemoryLeak(entity));
            }
        }

        if !findings.is_empty() {
            warn!(count = findings.len(), "consistency pass found violations");
        } else {
            debug!("consistency pass clean");
        }
        findings
    }

    /// SHA-256 over a canonical byte layout: sorted local ids, each with
    /// its position and rotation bit patterns.
    pub fn fingerprint(&mut self, store: &EntityStore) -> [u8; 32] {
        let mut objects: Vec<_> = store.iter_sim_objects().collect();
        objects.sort_by_key(|(_, o)| o.local_id);

        let mut hasher = Sha256::new();
        for (entity, object) in objects {
            hasher.update(object.local_id.to_be_bytes());
            hasher.update(object.full_id.as_bytes());
            if let Some(position) = store.position(entity) {
                for v in [position.0.x, position.0.y, position.0.z] {
                    hasher.update(v.to_bits().to_be_bytes());
                }
            }
            if let Some(rotation) = store.rotation(entity) {
                for v in [rotation.0.x, rotation.0.y, rotation.0.z, rotation.0.w] {
                    hasher.update(v.to_bits().to_be_bytes());
                }
            }
        }

        let digest: [u8; 32] = hasher.finalize().into();
        self.last_fingerprint = Some(digest);
        digest
    }

    pub fn last_fingerprint(&self) -> Option<[u8; 32]> {
        self.last_fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::messages::{FullObjectData, PrimKind};
    use crate::world::components::{Position, SimObject};
    use crate::world::lifecycle::{IncomingUpdate, LifecycleConfig};
    use crate::world::render::NullSink;
    use glam::{Quat, Vec3};
    use std::time::Instant;
    use uuid::Uuid;

    fn full(local_id: u32) -> FullObjectData {
        FullObjectData {
            local_id,
            full_id: Uuid::new_v4(),
            owner_id: Uuid::nil(),
            group_id: Uuid::nil(),
            parent_local_id: 0,
            kind: PrimKind::Box,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            base_color: [255; 4],
            material_ref: Uuid::nil(),
            mesh_ref: Uuid::nil(),
            flags: 0,
            click_action: 0,
            name: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn test_clean_world_has_no_findings() {
        let mut store = EntityStore::new();
        let mut lifecycle = ObjectLifecycle::new(LifecycleConfig::default());
        let bridge = RenderBridge::new(Box::new(NullSink::default()));
        lifecycle.apply(&mut store, IncomingUpdate::Full(full(1)), Instant::now());

        let mut checker = ConsistencyChecker::new();
        assert!(checker.check(&store, &lifecycle, &bridge).is_empty());
    }

    #[test]
    fn test_orphaned_entity_detected() {
        let mut store = EntityStore::new();
        let lifecycle = ObjectLifecycle::new(LifecycleConfig::default());
        let bridge = RenderBridge::new(Box::new(NullSink::default()));

        // SimObject entity created behind the lifecycle's back.
        let entity = store.create();
        store.set_sim_object(
            entity,
            SimObject {
                local_id: 7,
                full_id: Uuid::new_v4(),
                owner_id: Uuid::nil(),
                group_id: Uuid::nil(),
                parent_local_id: 0,
                last_update_at: Instant::now(),
                update_seq: 0,
            },
        );
        store.set_position(entity, Position(Vec3::ZERO));

        let mut checker = ConsistencyChecker::new();
        let findings = checker.check(&store, &lifecycle, &bridge);
        assert!(findings.contains(&Inconsistency::OrphanedEntity(entity)));
        // Missing visual also counts as corruption.
        assert!(findings.iter().any(|f| f.is_corruption()));
    }

    #[test]
    fn test_orphaned_metadata_detected() {
        let mut store = EntityStore::new();
        let mut lifecycle = ObjectLifecycle::new(LifecycleConfig::default());
        let bridge = RenderBridge::new(Box::new(NullSink::default()));
        lifecycle.apply(&mut store, IncomingUpdate::Full(full(3)), Instant::now());

        // Destroy the entity directly; metadata survives.
        let entity = store.find_by_local_id(3).unwrap();
        store.destroy(entity);

        let mut checker = ConsistencyChecker::new();
        let findings = checker.check(&store, &lifecycle, &bridge);
        assert!(findings.contains(&Inconsistency::OrphanedSimObject(3)));
        let op = findings[0].cleanup_op().unwrap();
        assert_eq!(op.kind, CleanupKind::Orphaned);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut store = EntityStore::new();
        let mut lifecycle = ObjectLifecycle::new(LifecycleConfig::default());
        lifecycle.apply(&mut store, IncomingUpdate::Full(full(1)), Instant::now());

        let mut checker = ConsistencyChecker::new();
        let a = checker.fingerprint(&store);
        let b = checker.fingerprint(&store);
        assert_eq!(a, b);

        let entity = store.find_by_local_id(1).unwrap();
        store.set_position(entity, Position(Vec3::new(1.0, 0.0, 0.0)));
        let c = checker.fingerprint(&store);
        assert_ne!(a, c);
    }
}
