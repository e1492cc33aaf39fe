//! Entity records and the uid-keyed store.
//!
//! Entities are identified by a stable `EntityUid` that is the only id ever
//! sent over the wire; process-local storage details never leak into the
//! protocol. Octree membership is an explicit two-state enum rather than a
//! toggled flag bit so that out-of-order link/unlink calls fail loudly.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::math::Vec3;

/// Stable, network-portable entity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityUid(pub u32);

/// Number of small integer attributes per entity.
pub const ENT_ATTRS: usize = 7;

/// Persistent entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Deleted/placeholder slot; has no spatial footprint and is never indexed.
    Empty,
    Marker,
    Light,
    Spotlight,
    Envmap,
    Sound,
    Particles,
    Mapmodel,
    Obstacle,
    Decal,
}

impl EntityKind {
    pub fn from_class(class: &str) -> Option<Self> {
        Some(match class {
            "empty" => EntityKind::Empty,
            "marker" => EntityKind::Marker,
            "light" => EntityKind::Light,
            "spotlight" => EntityKind::Spotlight,
            "envmap" => EntityKind::Envmap,
            "sound" => EntityKind::Sound,
            "particles" => EntityKind::Particles,
            "mapmodel" => EntityKind::Mapmodel,
            "obstacle" => EntityKind::Obstacle,
            "decal" => EntityKind::Decal,
            _ => return None,
        })
    }

    pub fn class_name(self) -> &'static str {
        match self {
            EntityKind::Empty => "empty",
            EntityKind::Marker => "marker",
            EntityKind::Light => "light",
            EntityKind::Spotlight => "spotlight",
            EntityKind::Envmap => "envmap",
            EntityKind::Sound => "sound",
            EntityKind::Particles => "particles",
            EntityKind::Mapmodel => "mapmodel",
            EntityKind::Obstacle => "obstacle",
            EntityKind::Decal => "decal",
        }
    }

    /// Category list this kind belongs to inside a leaf index record.
    pub fn category(self) -> EntCategory {
        match self {
            EntityKind::Decal => EntCategory::Decal,
            EntityKind::Mapmodel | EntityKind::Obstacle => EntCategory::Mapmodel,
            _ => EntCategory::Other,
        }
    }
}

/// Leaf index category. A uid appears in exactly one category list per leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntCategory {
    Decal,
    Mapmodel,
    Other,
}

bitflags::bitflags! {
    /// Entity behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EntFlags: u16 {
        const VISIBLE    = 1 << 0;
        const SPAWNED    = 1 << 1;
        const NO_COLLIDE = 1 << 2;
        const NO_SHADOW  = 1 << 3;
    }
}

/// Octree membership state. Transitions are asserted: linking an already
/// linked entity (or the reverse) is a programming error, not a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Unindexed,
    Indexed,
}

impl IndexState {
    pub fn mark_indexed(&mut self) {
        assert_eq!(*self, IndexState::Unindexed, "entity already indexed");
        *self = IndexState::Indexed;
    }

    pub fn mark_unindexed(&mut self) {
        assert_eq!(*self, IndexState::Indexed, "entity not indexed");
        *self = IndexState::Unindexed;
    }
}

/// A persistent world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub uid: EntityUid,
    pub kind: EntityKind,
    pub pos: Vec3,
    pub attrs: [i16; ENT_ATTRS],
    pub flags: EntFlags,
    pub index_state: IndexState,
    /// Stable handle to a paired entity (spotlight -> light), never a pointer.
    pub attached: Option<EntityUid>,
    /// Script-owned key/value state blob. BTreeMap keeps serialization
    /// order stable for persistence and tests.
    pub state_data: BTreeMap<String, String>,
}

impl Entity {
    /// Applies one replicated state-data key. `position` and `attrN` keys
    /// map onto the typed fields (both can affect the bounding box, so
    /// callers must wrap this in the unlink/relink protocol); everything
    /// else lands in the script blob.
    pub fn apply_state_kv(&mut self, key: &str, value: &str) {
        if key == "position" {
            let parts: Vec<f32> = value
                .split_whitespace()
                .filter_map(|p| p.parse().ok())
                .collect();
            if parts.len() == 3 {
                self.pos = Vec3::new(parts[0], parts[1], parts[2]);
            }
            return;
        }
        if let Some(idx) = key.strip_prefix("attr").and_then(|n| n.parse::<usize>().ok()) {
            if idx < self.attrs.len() {
                if let Ok(v) = value.parse::<i16>() {
                    self.attrs[idx] = v;
                    return;
                }
            }
        }
        self.state_data.insert(key.to_string(), value.to_string());
    }

    pub fn new(uid: EntityUid, kind: EntityKind, pos: Vec3) -> Self {
        Self {
            uid,
            kind,
            pos,
            attrs: [0; ENT_ATTRS],
            flags: EntFlags::VISIBLE,
            index_state: IndexState::Unindexed,
            attached: None,
            state_data: BTreeMap::new(),
        }
    }
}

/// Uid-keyed entity table with stable insertion-order enumeration.
#[derive(Debug, Default)]
pub struct EntityStore {
    records: HashMap<EntityUid, Entity>,
    order: Vec<EntityUid>,
    next_uid: u32,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
            next_uid: 1,
        }
    }

    /// Allocates the next server-side uid.
    pub fn alloc_uid(&mut self) -> EntityUid {
        let uid = EntityUid(self.next_uid);
        self.next_uid += 1;
        uid
    }

    /// Inserts a record. Replaces an existing record with the same uid
    /// without disturbing enumeration order.
    pub fn insert(&mut self, ent: Entity) {
        let uid = ent.uid;
        if self.records.insert(uid, ent).is_none() {
            self.order.push(uid);
        }
        if uid.0 >= self.next_uid {
            self.next_uid = uid.0 + 1;
        }
    }

    pub fn remove(&mut self, uid: EntityUid) -> Option<Entity> {
        let removed = self.records.remove(&uid);
        if removed.is_some() {
            self.order.retain(|u| *u != uid);
        }
        removed
    }

    pub fn get(&self, uid: EntityUid) -> Option<&Entity> {
        self.records.get(&uid)
    }

    pub fn get_mut(&mut self, uid: EntityUid) -> Option<&mut Entity> {
        self.records.get_mut(&uid)
    }

    pub fn contains(&self, uid: EntityUid) -> bool {
        self.records.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.order.iter().filter_map(move |u| self.records.get(u))
    }

    pub fn uids(&self) -> impl Iterator<Item = EntityUid> + '_ {
        self.order.iter().copied()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        self.next_uid = 1;
    }
}
