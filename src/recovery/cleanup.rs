//! Cleanup operations and their priority queue.
//!
//! Operations drain from a min-heap keyed by priority with FIFO order
//! inside a band. Emergency mode raises per-tick throughput. A failed
//! operation retries with an incremented attempt counter before being
//! recorded as permanently failed.

use crate::world::lifecycle::ObjectLifecycle;
use crate::world::store::{EntityId, EntityStore};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    Normal,
    Emergency,
    Orphaned,
    Stale,
    Connection,
    Forced,
    Cascade,
}

/// Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanupPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl CleanupKind {
    /// Default priority band per kind.
    pub fn priority(self) -> CleanupPriority {
        match self {
            CleanupKind::Emergency | CleanupKind::Connection => CleanupPriority::Critical,
            CleanupKind::Forced | CleanupKind::Cascade => CleanupPriority::High,
            CleanupKind::Orphaned => CleanupPriority::Normal,
            CleanupKind::Normal | CleanupKind::Stale => CleanupPriority::Low,
        }
    }
}

/// What an operation removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTarget {
    Entity(EntityId),
    LocalId(u32),
}

#[derive(Debug, Clone)]
pub struct CleanupOp {
    pub kind: CleanupKind,
    pub priority: CleanupPriority,
    pub target: CleanupTarget,
    pub reason: String,
    pub attempts: u8,
}

impl CleanupOp {
    pub fn new(kind: CleanupKind, target: CleanupTarget, reason: impl Into<String>) -> Self {
        Self {
            kind,
            priority: kind.priority(),
            target,
            reason: reason.into(),
            attempts: 0,
        }
    }
}

#[derive(Debug)]
struct QueuedOp {
    op: CleanupOp,
    seq: u64,
}

impl PartialEq for QueuedOp {
    fn eq(&self, other: &Self) -> bool {
        self.op.priority == other.op.priority && self.seq == other.seq
    }
}

impl Eq for QueuedOp {}

impl PartialOrd for QueuedOp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOp {
    // Inverted for min-heap behavior with FIFO tie-breaking.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .op
            .priority
            .cmp(&self.op.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default, Clone)]
pub struct CleanupStats {
    pub processed: u64,
    pub retried: u64,
    pub permanently_failed: u64,
}

pub struct CleanupQueue {
    heap: BinaryHeap<QueuedOp>,
    next_seq: u64,
    emergency: bool,
    normal_per_tick: usize,
    emergency_per_tick: usize,
    retry_cap: u8,
    stats: CleanupStats,
    failed: Vec<CleanupOp>,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            emergency: false,
            normal_per_tick: 3,
            emergency_per_tick: 10,
            retry_cap: 3,
            stats: CleanupStats::default(),
            failed: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn stats(&self) -> &CleanupStats {
        &self.stats
    }

    pub fn permanently_failed(&self) -> &[CleanupOp] {
        &self.failed
    }

    pub fn set_emergency(&mut self, emergency: bool) {
        if self.emergency != emergency {
            debug!(emergency, "cleanup emergency mode");
        }
        self.emergency = emergency;
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn enqueue(&mut self, op: CleanupOp) {
        if matches!(op.kind, CleanupKind::Emergency) {
            self.emergency = true;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedOp { op, seq });
    }

    /// Queue connection cleanup for every tracked object.
    pub fn enqueue_connection_loss(&mut self, lifecycle: &ObjectLifecycle) {
        let locals: Vec<u32> = lifecycle.local_ids().collect();
        for local_id in locals {
            self.enqueue(CleanupOp::new(
                CleanupKind::Connection,
                CleanupTarget::LocalId(local_id),
                "circuit lost",
            ));
        }
    }

    /// Emergency cull toward a capacity target: objects beyond the cull
    /// distance go first, then the farthest of the rest until the
    /// tracked count would reach the target.
    pub fn enqueue_distance_cull(
        &mut self,
        store: &EntityStore,
        lifecycle: &ObjectLifecycle,
        avatar_position: glam::Vec3,
        cull_distance: f32,
        capacity_target: usize,
    ) {
        let mut by_distance: Vec<(u32, f32)> = lifecycle
            .local_ids()
            .filter_map(|local_id| {
                let meta = lifecycle.meta(local_id)?;
                let position = store
                    .position(meta.entity)
                    .map(|p| p.0)
                    .unwrap_or(meta.last_position);
                Some((local_id, position.distance(avatar_position)))
            })
            .collect();
        by_distance.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let excess = lifecycle.tracked_count().saturating_sub(capacity_target);
        let mut queued = 0;
        for (local_id, distance) in by_distance {
            if queued >= excess && distance <= cull_distance {
                break;
            }
            if distance > cull_distance || queued < excess {
                self.enqueue(CleanupOp::new(
                    CleanupKind::Emergency,
                    CleanupTarget::LocalId(local_id),
                    format!("memory pressure cull at {distance:.1}m"),
                ));
                queued += 1;
            }
        }
        self.emergency = true;
    }

    /// Drain up to the per-tick throughput. Returns ops executed.
    pub fn process(&mut self, store: &mut EntityStore, lifecycle: &mut ObjectLifecycle) -> usize {
        let budget = if self.emergency {
            self.emergency_per_tick
        } else {
            self.normal_per_tick
        };

        let mut executed = 0;
        while executed < budget {
            let Some(queued) = self.heap.pop() else {
                self.emergency = false;
                break;
            };
            let mut op = queued.op;
            executed += 1;

            if Self::execute(store, lifecycle, &op) {
                self.stats.processed += 1;
            } else if op.attempts + 1 < self.retry_cap {
                op.attempts += 1;
                self.stats.retried += 1;
                self.enqueue(op);
            } else {
                warn!(reason = %op.reason, "cleanup permanently failed");
                self.stats.permanently_failed += 1;
                self.failed.push(op);
            }
        }
        executed
    }

    /// Run one op. Success means neither the entity nor its metadata
    /// survives.
    fn execute(store: &mut EntityStore, lifecycle: &mut ObjectLifecycle, op: &CleanupOp) -> bool {
        match op.target {
            CleanupTarget::LocalId(local_id) => {
                if let Some(meta) = lifecycle.meta(local_id) {
                    let entity = meta.entity;
                    lifecycle.kill(store, &[local_id]);
                    !store.contains(entity) && lifecycle.meta(local_id).is_none()
                } else {
                    // Metadata already gone; make sure no entity lingers.
                    if let Some(entity) = store.find_by_local_id(local_id) {
                        store.destroy(entity);
                        !store.contains(entity)
                    } else {
                        true
                    }
                }
            }
            CleanupTarget::Entity(entity) => {
                if store.contains(entity) {
                    let local_id = store.sim_object(entity).map(|o| o.local_id);
                    store.destroy(entity);
                    if let Some(local_id) = local_id {
                        lifecycle.forget(local_id);
                    }
                }
                !store.contains(entity)
            }
        }
    }
}

impl Default for CleanupQueue {
    fn default() -> Self {
        Self::new()
    }
}
