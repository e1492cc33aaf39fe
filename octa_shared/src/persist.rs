//! Map entity persistence.
//!
//! Exports the live entity set to JSON for map storage and imports it
//! back. Enumeration order is the entity store's stable insertion order,
//! so repeated exports of an unchanged world are byte-identical.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityUid, IndexState};
use crate::math::Vec3;
use crate::world::WorldState;

/// Export format version.
pub const MAP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapExport {
    pub format_version: u32,
    pub map_name: String,
    pub world_size: i32,
    pub entities: Vec<EntityRecord>,
}

/// One persisted entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub uid: EntityUid,
    pub class: String,
    pub pos: Vec3,
    pub attrs: Vec<i16>,
    /// Script-side state blob, serialized as JSON text.
    pub state_data: String,
}

impl EntityRecord {
    fn from_entity(ent: &Entity) -> Self {
        Self {
            uid: ent.uid,
            class: ent.kind.class_name().to_string(),
            pos: ent.pos,
            attrs: ent.attrs.to_vec(),
            state_data: serde_json::to_string(&ent.state_data).unwrap_or_else(|_| "{}".into()),
        }
    }
}

/// Serializes the live entity set.
pub fn export_world(world: &WorldState, map_name: &str) -> anyhow::Result<String> {
    let export = MapExport {
        format_version: MAP_FORMAT_VERSION,
        map_name: map_name.to_string(),
        world_size: world.world_size(),
        entities: world.entities().map(EntityRecord::from_entity).collect(),
    };
    serde_json::to_string_pretty(&export).context("serialize map export")
}

/// Loads an exported entity set into a freshly reset world. Unknown
/// classes are skipped with a warning rather than failing the import.
pub fn import_world(world: &mut WorldState, json: &str) -> anyhow::Result<usize> {
    let export: MapExport = serde_json::from_str(json).context("parse map export")?;
    anyhow::ensure!(
        export.format_version == MAP_FORMAT_VERSION,
        "unsupported map format version {}",
        export.format_version
    );
    world.reset(export.world_size);
    let mut loaded = 0;
    for record in &export.entities {
        let Some(kind) = crate::entity::EntityKind::from_class(&record.class) else {
            tracing::warn!(class = %record.class, uid = record.uid.0, "skipping unknown entity class");
            continue;
        };
        let mut ent = Entity::new(record.uid, kind, record.pos);
        for (i, a) in record.attrs.iter().take(ent.attrs.len()).enumerate() {
            ent.attrs[i] = *a;
        }
        ent.state_data = serde_json::from_str(&record.state_data).unwrap_or_default();
        ent.index_state = IndexState::Unindexed;
        world.add_entity(ent);
        loaded += 1;
    }
    Ok(loaded)
}
