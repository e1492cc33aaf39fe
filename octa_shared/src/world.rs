//! World state owner.
//!
//! Owns the octree, the entity table, the dynamic light queue, the
//! out-of-world overflow list, and the model bounds registry. Every core
//! operation takes this object by reference; there is no process-global
//! state, so tests can run several independent worlds side by side.
//!
//! Mutation discipline: any change that can affect an entity's bounding
//! box goes through `edit_entity`, which unlinks with the old box, applies
//! the mutation, and relinks with the new box — in that order, always.

use tracing::debug;

use crate::bounds::{entity_bounds, StaticModelBounds};
use crate::dynlight::{DynLight, DynLightParams, DynLightQueue};
use crate::entity::{Entity, EntityKind, EntityStore, EntityUid, IndexState};
use crate::math::{Aabb, IVec3, Vec3};
use crate::octree::{LeafEnts, Octree};

/// The mutable world: spatial index plus entity and light tables.
pub struct WorldState {
    octree: Octree,
    entities: EntityStore,
    pub lights: DynLightQueue,
    pub models: StaticModelBounds,
    /// Entities whose bounds miss the world volume entirely.
    outside: Vec<EntityUid>,
    min_entity_radius: f32,
    size_ceiling: i32,
}

impl WorldState {
    pub fn new(world_size: i32, size_ceiling: i32, min_entity_radius: f32) -> Self {
        Self {
            octree: Octree::new(world_size, size_ceiling),
            entities: EntityStore::new(),
            lights: DynLightQueue::new(),
            models: StaticModelBounds::new(),
            outside: Vec::new(),
            min_entity_radius,
            size_ceiling,
        }
    }

    /// Drops all entities, lights and index state; keeps model bounds.
    pub fn reset(&mut self, world_size: i32) {
        self.octree = Octree::new(world_size, self.size_ceiling);
        self.entities.clear();
        self.lights.clear();
        self.outside.clear();
    }

    pub fn world_size(&self) -> i32 {
        self.octree.world_size()
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn octree_mut(&mut self) -> &mut Octree {
        &mut self.octree
    }

    pub fn entity(&self, uid: EntityUid) -> Option<&Entity> {
        self.entities.get(uid)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Entities in stable insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn alloc_uid(&mut self) -> EntityUid {
        self.entities.alloc_uid()
    }

    pub fn bounds_of(&self, ent: &Entity) -> Option<Aabb> {
        entity_bounds(ent, &self.models, self.min_entity_radius)
    }

    // ─── Lifecycle ───

    /// Inserts and indexes an entity. The record must arrive unindexed.
    pub fn add_entity(&mut self, ent: Entity) {
        assert_eq!(ent.index_state, IndexState::Unindexed);
        let uid = ent.uid;
        self.entities.insert(ent);
        self.link(uid);
    }

    /// Unindexes and removes an entity, clearing any attached-entity
    /// back-references and owned dynamic lights.
    pub fn remove_entity(&mut self, uid: EntityUid) -> Option<Entity> {
        if !self.entities.contains(uid) {
            return None;
        }
        self.unlink(uid);
        self.lights.remove_owned(uid);
        let removed = self.entities.remove(uid);
        let stale: Vec<EntityUid> = self
            .entities
            .iter()
            .filter(|e| e.attached == Some(uid))
            .map(|e| e.uid)
            .collect();
        for holder in stale {
            if let Some(e) = self.entities.get_mut(holder) {
                e.attached = None;
            }
        }
        removed
    }

    /// Applies a mutation under the unlink-mutate-relink protocol.
    /// Returns false when the uid is unknown.
    pub fn edit_entity(&mut self, uid: EntityUid, f: impl FnOnce(&mut Entity)) -> bool {
        if !self.entities.contains(uid) {
            return false;
        }
        self.unlink(uid);
        if let Some(ent) = self.entities.get_mut(uid) {
            f(ent);
        }
        self.link(uid);
        true
    }

    /// Pairs `uid` with the nearest entity of `kind` within `radius`,
    /// storing a stable uid handle. Returns the chosen partner.
    pub fn attach_nearby(
        &mut self,
        uid: EntityUid,
        kind: EntityKind,
        radius: f32,
    ) -> Option<EntityUid> {
        let pos = self.entities.get(uid)?.pos;
        let best = self
            .entities
            .iter()
            .filter(|e| e.kind == kind && e.uid != uid)
            .map(|e| (e.pos.dist(pos), e.uid))
            .filter(|(d, _)| *d <= radius)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, u)| u);
        if let Some(partner) = best {
            if let Some(e) = self.entities.get_mut(uid) {
                e.attached = Some(partner);
            }
        }
        best
    }

    // ─── Indexing ───

    fn link(&mut self, uid: EntityUid) {
        let Some(ent) = self.entities.get(uid) else {
            return;
        };
        let Some(bbox) = entity_bounds(ent, &self.models, self.min_entity_radius) else {
            // No spatial footprint; stays unindexed.
            return;
        };
        let cat = ent.kind.category();
        if bbox.intersects(&self.octree.volume()) {
            self.octree.link(uid, cat, &bbox);
        } else {
            debug!(uid = uid.0, "entity outside world volume, using overflow list");
            self.outside.push(uid);
        }
        if let Some(ent) = self.entities.get_mut(uid) {
            ent.index_state.mark_indexed();
        }
    }

    fn unlink(&mut self, uid: EntityUid) {
        let Self {
            octree,
            entities,
            models,
            outside,
            min_entity_radius,
            ..
        } = self;
        let Some(ent) = entities.get(uid) else {
            return;
        };
        if ent.index_state == IndexState::Unindexed {
            return;
        }
        let bbox = entity_bounds(ent, &*models, *min_entity_radius)
            .expect("indexed entity must have bounds");
        let cat = ent.kind.category();
        if let Some(at) = outside.iter().position(|u| *u == uid) {
            outside.remove(at);
        } else {
            let min_radius = *min_entity_radius;
            let resolve = |member: EntityUid| -> Option<Aabb> {
                entities
                    .get(member)
                    .and_then(|e| entity_bounds(e, &*models, min_radius))
            };
            octree.unlink(uid, cat, &bbox, &resolve);
        }
        if let Some(ent) = self.entities.get_mut(uid) {
            ent.index_state.mark_unindexed();
        }
    }

    /// Uids currently parked in the out-of-world overflow list.
    pub fn overflow(&self) -> &[EntityUid] {
        &self.outside
    }

    // ─── Renderer surface ───

    /// All populated octree leaves, for render batch enumeration.
    pub fn visible_leaves(&self) -> Vec<&LeafEnts> {
        self.octree.leaves()
    }

    /// Drains leaves whose aggregate bounds changed since the last drain.
    pub fn take_dirty_leaves(&mut self) -> Vec<(IVec3, i32)> {
        self.octree.take_dirty_leaves()
    }

    // ─── Dynamic lights ───

    pub fn enqueue_light(&mut self, params: DynLightParams, now: u64, duration_ms: u64) {
        self.lights.enqueue(params, now, duration_ms);
    }

    pub fn tick_lights(&mut self, now: u64) {
        self.lights.tick(now);
    }

    pub fn cull_lights(
        &self,
        viewpoint: Vec3,
        max_dist: f32,
        limit: usize,
        now: u64,
    ) -> Vec<DynLight> {
        self.lights.cull(viewpoint, max_dist, limit, now)
    }

    // ─── World resize ───

    /// Doubles the world size. Existing entities keep their absolute
    /// positions and index records (the old root becomes octant 0).
    /// Returns false at the size ceiling.
    pub fn enlarge_world(&mut self) -> bool {
        self.octree.enlarge()
    }

    /// Halves the world size by promoting the single content-bearing root
    /// octant, translating every entity by the promoted octant's origin
    /// offset. Returns false when the shape precondition fails.
    pub fn shrink_world(&mut self) -> bool {
        let indexed: Vec<EntityUid> = self
            .entities
            .iter()
            .filter(|e| e.index_state == IndexState::Indexed)
            .map(|e| e.uid)
            .collect();
        for uid in &indexed {
            self.unlink(*uid);
        }
        let offset = self.octree.shrink();
        if let Some(offset) = offset {
            let shift = IVec3::ZERO.sub(offset).to_vec3();
            for uid in &indexed {
                if let Some(ent) = self.entities.get_mut(*uid) {
                    ent.pos = ent.pos.add(shift);
                }
            }
        }
        for uid in &indexed {
            self.link(*uid);
        }
        offset.is_some()
    }

    // ─── Diagnostics ───

    /// Verifies index invariants; panics on violation. Test/debug helper.
    pub fn check_index_consistency(&self) {
        for leaf in self.octree.leaves() {
            assert!(!leaf.is_empty(), "empty leaf record not pruned");
            let volume = leaf.volume();
            let mut agg: Option<Aabb> = None;
            for member in leaf.members() {
                let ent = self
                    .entities
                    .get(member)
                    .unwrap_or_else(|| panic!("leaf references dead uid {}", member.0));
                assert_eq!(ent.index_state, IndexState::Indexed);
                let bb = self
                    .bounds_of(ent)
                    .expect("indexed entity must have bounds")
                    .clip(&volume);
                agg = Some(match agg {
                    Some(a) => a.union(&bb),
                    None => bb,
                });
            }
            assert_eq!(Some(leaf.bounds), agg, "stale aggregate bounds");
        }
        for ent in self.entities.iter() {
            if ent.index_state == IndexState::Indexed && !self.outside.contains(&ent.uid) {
                let bb = self.bounds_of(ent).expect("indexed entity must have bounds");
                let hit = self
                    .octree
                    .leaves_intersecting(&bb)
                    .iter()
                    .any(|l| l.contains(ent.uid));
                assert!(hit, "indexed entity {} not found in octree", ent.uid.0);
            }
        }
    }
}
