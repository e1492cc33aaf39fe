//! Scripting collaborator seam.
//!
//! The world core calls out to an external entity-behavior system through
//! this narrow interface and treats every call as an opaque remote call
//! with a success/failure return. Failures are logged and degraded
//! gracefully; nothing ever raises across this boundary.

use std::collections::{BTreeMap, HashMap};

use crate::entity::EntityUid;
use crate::proto::ClientId;

/// Narrow interface to the external entity-behavior system.
pub trait ScriptBridge {
    /// Constructs the scripting-side logic entity. Returns false on failure.
    fn entity_new_with_sd(
        &mut self,
        uid: EntityUid,
        class: &str,
        x: f32,
        y: f32,
        z: f32,
        state_data: &str,
        extra: &str,
    ) -> bool;

    fn entity_remove(&mut self, uid: EntityUid) -> bool;

    /// Applies one state-data key. `actor` names the client whose request
    /// caused the change, when there is one.
    fn entity_set_sdata(
        &mut self,
        uid: EntityUid,
        key: &str,
        value: &str,
        actor: Option<ClientId>,
    ) -> bool;

    /// Replaces the whole state blob at once.
    fn entity_set_sdata_full(&mut self, uid: EntityUid, blob: &str) -> bool;

    fn entity_exists(&self, uid: EntityUid) -> bool;

    fn entity_get_proto_name(&self, uid: EntityUid) -> Option<String>;

    /// Serializes the script-side state blob, optionally refreshing the
    /// stored position first.
    fn entity_serialize_sdata(&self, uid: EntityUid, pos: Option<(f32, f32, f32)>)
        -> Option<String>;
}

/// In-process bridge used by tests and the standalone binaries: stores
/// state blobs in a map and accepts every call.
#[derive(Debug, Default)]
pub struct RecordingScriptBridge {
    entities: HashMap<EntityUid, ScriptRecord>,
    last_actor: Option<ClientId>,
}

#[derive(Debug, Clone, Default)]
struct ScriptRecord {
    class: String,
    pos: (f32, f32, f32),
    sdata: BTreeMap<String, String>,
}

impl RecordingScriptBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Actor of the most recent `entity_set_sdata` call.
    pub fn last_actor(&self) -> Option<ClientId> {
        self.last_actor
    }
}

impl ScriptBridge for RecordingScriptBridge {
    fn entity_new_with_sd(
        &mut self,
        uid: EntityUid,
        class: &str,
        x: f32,
        y: f32,
        z: f32,
        state_data: &str,
        _extra: &str,
    ) -> bool {
        let sdata: BTreeMap<String, String> =
            serde_json::from_str(state_data).unwrap_or_default();
        self.entities.insert(
            uid,
            ScriptRecord {
                class: class.to_string(),
                pos: (x, y, z),
                sdata,
            },
        );
        true
    }

    fn entity_remove(&mut self, uid: EntityUid) -> bool {
        self.entities.remove(&uid).is_some()
    }

    fn entity_set_sdata(
        &mut self,
        uid: EntityUid,
        key: &str,
        value: &str,
        actor: Option<ClientId>,
    ) -> bool {
        self.last_actor = actor;
        match self.entities.get_mut(&uid) {
            Some(rec) => {
                rec.sdata.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    fn entity_set_sdata_full(&mut self, uid: EntityUid, blob: &str) -> bool {
        let Some(rec) = self.entities.get_mut(&uid) else {
            return false;
        };
        match serde_json::from_str(blob) {
            Ok(sdata) => {
                rec.sdata = sdata;
                true
            }
            Err(_) => false,
        }
    }

    fn entity_exists(&self, uid: EntityUid) -> bool {
        self.entities.contains_key(&uid)
    }

    fn entity_get_proto_name(&self, uid: EntityUid) -> Option<String> {
        self.entities.get(&uid).map(|r| r.class.clone())
    }

    fn entity_serialize_sdata(
        &self,
        uid: EntityUid,
        pos: Option<(f32, f32, f32)>,
    ) -> Option<String> {
        let rec = self.entities.get(&uid)?;
        let mut sdata = rec.sdata.clone();
        if let Some((x, y, z)) = pos.or(Some(rec.pos)) {
            sdata.insert("position".to_string(), format!("{x} {y} {z}"));
        }
        serde_json::to_string(&sdata).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_bridge_round_trips_sdata() {
        let mut bridge = RecordingScriptBridge::new();
        let uid = EntityUid(5);
        assert!(bridge.entity_new_with_sd(uid, "light", 1.0, 2.0, 3.0, "{}", ""));
        assert!(bridge.entity_exists(uid));
        assert!(bridge.entity_set_sdata(uid, "radius", "48", Some(ClientId(3))));
        assert_eq!(bridge.last_actor(), Some(ClientId(3)));
        let blob = bridge.entity_serialize_sdata(uid, None).unwrap();
        assert!(blob.contains("radius"));
        assert_eq!(bridge.entity_get_proto_name(uid).as_deref(), Some("light"));
        assert!(bridge.entity_remove(uid));
        assert!(!bridge.entity_exists(uid));
    }

    #[test]
    fn sdata_on_missing_entity_reports_failure() {
        let mut bridge = RecordingScriptBridge::new();
        assert!(!bridge.entity_set_sdata(EntityUid(9), "k", "v", None));
    }
}
