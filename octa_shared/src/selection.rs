//! Editor selection and undo.
//!
//! Tracks the ordered set of entities selected for editing. Undo snapshots
//! deep-copy the selected entities' full state; restoring replays each
//! record through the standard unlink-mutate-relink path so the octree
//! index never desynchronizes from entity state.

use crate::entity::{Entity, EntityUid};
use crate::world::WorldState;

/// A deep copy of selected entities' state at snapshot time.
#[derive(Debug, Clone)]
pub struct UndoSnapshot {
    records: Vec<Entity>,
}

impl UndoSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Ordered selection of entity uids.
#[derive(Debug, Default)]
pub struct Selection {
    ids: Vec<EntityUid>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a uid; keeps insertion order, ignores duplicates.
    pub fn select(&mut self, uid: EntityUid) {
        if !self.ids.contains(&uid) {
            self.ids.push(uid);
        }
    }

    pub fn deselect(&mut self, uid: EntityUid) {
        self.ids.retain(|u| *u != uid);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn ids(&self) -> &[EntityUid] {
        &self.ids
    }

    pub fn contains(&self, uid: EntityUid) -> bool {
        self.ids.contains(&uid)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Captures the full state of every selected entity.
    pub fn snapshot(&self, world: &WorldState) -> UndoSnapshot {
        UndoSnapshot {
            records: self
                .ids
                .iter()
                .filter_map(|uid| world.entity(*uid).cloned())
                .collect(),
        }
    }

    /// Applies `f` to every selected entity, each mutation individually
    /// round-tripping through the octree linker. Returns the pre-edit
    /// snapshot so the whole group edit is one undo step.
    pub fn group_edit(
        &self,
        world: &mut WorldState,
        mut f: impl FnMut(&mut Entity),
    ) -> UndoSnapshot {
        let snap = self.snapshot(world);
        for uid in &self.ids {
            world.edit_entity(*uid, &mut f);
        }
        snap
    }

    /// Translates every selected entity by `delta`.
    pub fn translate(&self, world: &mut WorldState, delta: crate::math::Vec3) -> UndoSnapshot {
        self.group_edit(world, |e| e.pos = e.pos.add(delta))
    }

    /// Nudges an attribute on every selected entity (editor push op).
    pub fn push_attr(&self, world: &mut WorldState, attr: usize, amount: i16) -> UndoSnapshot {
        self.group_edit(world, |e| {
            if attr < e.attrs.len() {
                e.attrs[attr] = e.attrs[attr].saturating_add(amount);
            }
        })
    }
}

/// Restores a snapshot verbatim. Each entity re-runs the standard
/// remove-mutate-reindex sequence; entities deleted since the snapshot are
/// recreated.
pub fn restore(world: &mut WorldState, snapshot: &UndoSnapshot) {
    for record in &snapshot.records {
        if world.entity(record.uid).is_some() {
            world.edit_entity(record.uid, |e| {
                let uid = e.uid;
                let index_state = e.index_state;
                *e = record.clone();
                e.uid = uid;
                e.index_state = index_state;
            });
        } else {
            let mut ent = record.clone();
            ent.index_state = crate::entity::IndexState::Unindexed;
            world.add_entity(ent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKind, IndexState};
    use crate::math::Vec3;

    fn world_with_marker(uid: u32, pos: Vec3) -> WorldState {
        let mut world = WorldState::new(1024, 1 << 16, 2.0);
        let ent = Entity::new(EntityUid(uid), EntityKind::Marker, pos);
        world.add_entity(ent);
        world
    }

    #[test]
    fn selection_is_ordered_and_deduplicated() {
        let mut sel = Selection::new();
        sel.select(EntityUid(3));
        sel.select(EntityUid(1));
        sel.select(EntityUid(3));
        assert_eq!(sel.ids(), &[EntityUid(3), EntityUid(1)]);
    }

    #[test]
    fn restore_round_trips_a_translate() {
        let mut world = world_with_marker(1, Vec3::new(100.0, 100.0, 100.0));
        let mut sel = Selection::new();
        sel.select(EntityUid(1));

        let snap = sel.translate(&mut world, Vec3::new(32.0, 0.0, 0.0));
        assert_eq!(world.entity(EntityUid(1)).unwrap().pos.x, 132.0);

        restore(&mut world, &snap);
        let ent = world.entity(EntityUid(1)).unwrap();
        assert_eq!(ent.pos.x, 100.0);
        assert_eq!(ent.index_state, IndexState::Indexed);
        world.check_index_consistency();
    }

    #[test]
    fn restore_recreates_deleted_entities() {
        let mut world = world_with_marker(1, Vec3::new(50.0, 50.0, 50.0));
        let mut sel = Selection::new();
        sel.select(EntityUid(1));
        let snap = sel.snapshot(&world);

        world.remove_entity(EntityUid(1));
        assert!(world.entity(EntityUid(1)).is_none());

        restore(&mut world, &snap);
        assert!(world.entity(EntityUid(1)).is_some());
        world.check_index_consistency();
    }

    #[test]
    fn group_edit_touches_every_member() {
        let mut world = world_with_marker(1, Vec3::new(10.0, 10.0, 10.0));
        world.add_entity(Entity::new(
            EntityUid(2),
            EntityKind::Marker,
            Vec3::new(20.0, 20.0, 20.0),
        ));
        let mut sel = Selection::new();
        sel.select(EntityUid(1));
        sel.select(EntityUid(2));
        let snap = sel.push_attr(&mut world, 0, 5);
        assert_eq!(snap.len(), 2);
        assert_eq!(world.entity(EntityUid(1)).unwrap().attrs[0], 5);
        assert_eq!(world.entity(EntityUid(2)).unwrap().attrs[0], 5);
    }
}
