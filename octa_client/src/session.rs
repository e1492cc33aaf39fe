//! Client-side replica session.
//!
//! Pure (socket-free) client logic: mirrors the server's entity set into a
//! local `WorldState`, tracks the scenario handshake, and queues requests
//! for the transport layer. The replica is never authoritative — every
//! edit goes to the server as a request and only lands here when the
//! confirmation comes back.

use anyhow::Context;
use tracing::{debug, info, warn};

use octa_shared::dispatch::{Dispatch, HandlerTable, Role, Sender};
use octa_shared::entity::{Entity, EntityKind, EntityUid};
use octa_shared::math::Vec3;
use octa_shared::proto::{
    GameMsg, WirePos, MSG_ALL_ACTIVE_ENTITIES_SENT, MSG_LOGIC_ENTITY_COMPLETE,
    MSG_LOGIC_ENTITY_REMOVAL, MSG_NOTIFY_ABOUT_CURRENT_SCENARIO, MSG_PREPARE_FOR_NEW_SCENARIO,
    MSG_STATE_DATA_UPDATE, MSG_UNRELIABLE_STATE_DATA_UPDATE,
};
use octa_shared::script::ScriptBridge;
use octa_shared::world::WorldState;

/// Scenario sync progress on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No scenario known yet (or the server told us to drop the old one).
    NoScenario,
    /// Scenario named; entity stream in flight.
    Receiving,
    /// Full entity set received.
    Synced,
}

/// Mutable replica state the handler table operates on.
pub struct ReplicaCore {
    pub world: WorldState,
    pub script: Box<dyn ScriptBridge + Send>,
    sync: SyncState,
    scenario_code: String,
    map_name: String,
    outbox: Vec<GameMsg>,
}

impl ReplicaCore {
    /// Applies a complete entity notification. Idempotent: a uid we
    /// already hold is updated in place (unlink-mutate-relink), a new
    /// one is constructed and indexed.
    fn apply_complete(
        &mut self,
        uid: EntityUid,
        attached: Option<EntityUid>,
        class: &str,
        pos: Vec3,
        state_blob: &str,
    ) {
        let kind = EntityKind::from_class(class).unwrap_or_else(|| {
            warn!(uid = uid.0, class, "unknown entity class, using marker placeholder");
            EntityKind::Marker
        });
        let sdata: std::collections::BTreeMap<String, String> =
            serde_json::from_str(state_blob).unwrap_or_default();

        if self.world.entity(uid).is_some() {
            self.world.edit_entity(uid, |e| {
                e.kind = kind;
                e.pos = pos;
                e.attached = attached;
                for (k, v) in &sdata {
                    e.apply_state_kv(k, v);
                }
            });
            self.script.entity_set_sdata_full(uid, state_blob);
            debug!(uid = uid.0, "entity refreshed");
        } else {
            let mut ent = Entity::new(uid, kind, pos);
            ent.attached = attached;
            for (k, v) in &sdata {
                ent.apply_state_kv(k, v);
            }
            self.world.add_entity(ent);
            self.script
                .entity_new_with_sd(uid, class, pos.x, pos.y, pos.z, state_blob, "");
            debug!(uid = uid.0, class, "entity replicated");
        }
    }

    fn apply_removal(&mut self, uid: EntityUid) {
        if self.world.remove_entity(uid).is_none() {
            debug!(uid = uid.0, "removal for unknown entity ignored");
            return;
        }
        self.script.entity_remove(uid);
    }

    /// Last writer wins: later updates simply overwrite, no sequencing.
    fn apply_state_update(&mut self, uid: EntityUid, key: &str, value: &str) {
        if !self.world.edit_entity(uid, |e| e.apply_state_kv(key, value)) {
            debug!(uid = uid.0, key, "state update for unknown entity dropped");
            return;
        }
        self.script.entity_set_sdata(uid, key, value, None);
    }
}

/// The client replica: state plus the client-role handler table.
pub struct ClientSession {
    core: ReplicaCore,
    handlers: HandlerTable<ReplicaCore>,
}

impl ClientSession {
    pub fn new(world: WorldState, script: Box<dyn ScriptBridge + Send>) -> Self {
        let mut handlers = HandlerTable::new(Role::Client);
        handlers.register(MSG_PREPARE_FOR_NEW_SCENARIO, on_prepare_for_new_scenario);
        handlers.register(MSG_NOTIFY_ABOUT_CURRENT_SCENARIO, on_notify_about_scenario);
        handlers.register(MSG_ALL_ACTIVE_ENTITIES_SENT, on_all_entities_sent);
        handlers.register(MSG_LOGIC_ENTITY_COMPLETE, on_logic_entity_complete);
        handlers.register(MSG_LOGIC_ENTITY_REMOVAL, on_logic_entity_removal);
        handlers.register(MSG_STATE_DATA_UPDATE, on_state_data_update);
        handlers.register(MSG_UNRELIABLE_STATE_DATA_UPDATE, on_state_data_update);
        Self {
            core: ReplicaCore {
                world,
                script,
                sync: SyncState::NoScenario,
                scenario_code: String::new(),
                map_name: String::new(),
                outbox: Vec::new(),
            },
            handlers,
        }
    }

    pub fn world(&self) -> &WorldState {
        &self.core.world
    }

    pub fn world_mut(&mut self) -> &mut WorldState {
        &mut self.core.world
    }

    pub fn sync_state(&self) -> SyncState {
        self.core.sync
    }

    pub fn scenario_code(&self) -> &str {
        &self.core.scenario_code
    }

    pub fn map_name(&self) -> &str {
        &self.core.map_name
    }

    /// Routes a server message through the handler table.
    pub fn handle(&mut self, msg: GameMsg) -> anyhow::Result<Dispatch> {
        self.handlers
            .dispatch(&mut self.core, Sender::SERVER, msg)
            .context("client dispatch")
    }

    /// Drains queued client-to-server requests.
    pub fn take_outbox(&mut self) -> Vec<GameMsg> {
        std::mem::take(&mut self.core.outbox)
    }

    // ─── Requests (all server-bound; the replica is never edited here) ───

    pub fn request_scenario(&mut self) {
        self.core.outbox.push(GameMsg::RequestCurrentScenario);
    }

    pub fn request_new_entity(&mut self, class: &str, pos: Vec3, state_data: &str, extra: &str) {
        self.core.outbox.push(GameMsg::NewEntityRequest {
            class: class.to_string(),
            pos: WirePos::from_vec3(pos),
            state_data: state_data.to_string(),
            extra: extra.to_string(),
        });
    }

    pub fn request_removal(&mut self, uid: EntityUid) {
        self.core.outbox.push(GameMsg::RequestEntityRemoval { uid });
    }

    /// Queues a state change stamped with the current scenario code so the
    /// server can drop it if the session has moved on.
    pub fn request_state_change(&mut self, uid: EntityUid, key: &str, value: &str, reliable: bool) {
        if self.core.sync != SyncState::Synced {
            debug!(uid = uid.0, key, "state change before sync dropped");
            return;
        }
        let msg = if reliable {
            GameMsg::StateDataRequest {
                uid,
                key: key.to_string(),
                value: value.to_string(),
                scenario_code: self.core.scenario_code.clone(),
            }
        } else {
            GameMsg::UnreliableStateDataRequest {
                uid,
                key: key.to_string(),
                value: value.to_string(),
                scenario_code: self.core.scenario_code.clone(),
            }
        };
        self.core.outbox.push(msg);
    }

    /// Per-tick upkeep for the replica's dynamic lights.
    pub fn tick(&mut self, now_ms: u64) {
        self.core.world.tick_lights(now_ms);
    }
}

// ─── Handlers (client role) ───

fn on_prepare_for_new_scenario(
    core: &mut ReplicaCore,
    _sender: Sender,
    _msg: GameMsg,
) -> anyhow::Result<()> {
    let size = core.world.world_size();
    core.world.reset(size);
    core.sync = SyncState::NoScenario;
    core.scenario_code.clear();
    info!("scenario switch announced, replica dropped");
    // Ask for the new scenario right away; the transport retries if this
    // races the server's own activation.
    core.outbox.push(GameMsg::RequestCurrentScenario);
    Ok(())
}

fn on_notify_about_scenario(
    core: &mut ReplicaCore,
    _sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let GameMsg::NotifyAboutCurrentScenario { map, scenario_code } = msg else {
        unreachable!("registered for NotifyAboutCurrentScenario only");
    };
    // A re-announcement of the scenario we already hold carries nothing
    // new; dropping to Receiving here would stall outgoing edits.
    if core.sync == SyncState::Synced && scenario_code == core.scenario_code {
        debug!(%map, "repeated scenario notification ignored");
        return Ok(());
    }
    info!(%map, %scenario_code, "scenario named");
    core.map_name = map;
    core.scenario_code = scenario_code;
    core.sync = SyncState::Receiving;
    Ok(())
}

fn on_all_entities_sent(
    core: &mut ReplicaCore,
    _sender: Sender,
    _msg: GameMsg,
) -> anyhow::Result<()> {
    core.sync = SyncState::Synced;
    info!(entities = core.world.entity_count(), "entity set synced");
    Ok(())
}

fn on_logic_entity_complete(
    core: &mut ReplicaCore,
    _sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let GameMsg::LogicEntityComplete {
        uid,
        attached,
        class,
        pos,
        state_data,
    } = msg
    else {
        unreachable!("registered for LogicEntityComplete only");
    };
    core.apply_complete(uid, attached, &class, pos.to_vec3(), &state_data);
    Ok(())
}

fn on_logic_entity_removal(
    core: &mut ReplicaCore,
    _sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let GameMsg::LogicEntityRemoval { uid } = msg else {
        unreachable!("registered for LogicEntityRemoval only");
    };
    core.apply_removal(uid);
    Ok(())
}

fn on_state_data_update(
    core: &mut ReplicaCore,
    _sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let (uid, key, value) = match msg {
        GameMsg::StateDataUpdate {
            uid, key, value, ..
        } => (uid, key, value),
        GameMsg::UnreliableStateDataUpdate { uid, key, value } => (uid, key, value),
        _ => unreachable!("registered for state data updates only"),
    };
    core.apply_state_update(uid, &key, &value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use octa_shared::entity::IndexState;
    use octa_shared::script::RecordingScriptBridge;

    fn session() -> ClientSession {
        let world = WorldState::new(1024, 1 << 16, 2.0);
        let mut s = ClientSession::new(world, Box::new(RecordingScriptBridge::new()));
        s.handle(GameMsg::NotifyAboutCurrentScenario {
            map: "m".into(),
            scenario_code: "abcd".into(),
        })
        .unwrap();
        s.handle(GameMsg::AllActiveEntitiesSent).unwrap();
        s
    }

    fn complete(uid: u32, pos: Vec3) -> GameMsg {
        GameMsg::LogicEntityComplete {
            uid: EntityUid(uid),
            attached: None,
            class: "light".into(),
            pos: WirePos::from_vec3(pos),
            state_data: "{}".into(),
        }
    }

    #[test]
    fn complete_creates_and_indexes_replica_entity() {
        let mut s = session();
        s.handle(complete(5, Vec3::new(100.0, 100.0, 100.0))).unwrap();
        let ent = s.world().entity(EntityUid(5)).unwrap();
        assert_eq!(ent.kind, EntityKind::Light);
        assert_eq!(ent.index_state, IndexState::Indexed);
        s.world().check_index_consistency();
    }

    #[test]
    fn duplicate_complete_updates_in_place() {
        let mut s = session();
        s.handle(complete(5, Vec3::new(100.0, 100.0, 100.0))).unwrap();
        s.handle(complete(5, Vec3::new(200.0, 200.0, 200.0))).unwrap();
        assert_eq!(s.world().entity_count(), 1);
        assert_eq!(
            s.world().entity(EntityUid(5)).unwrap().pos,
            Vec3::new(200.0, 200.0, 200.0)
        );
        s.world().check_index_consistency();
    }

    #[test]
    fn unknown_class_becomes_marker_placeholder() {
        let mut s = session();
        s.handle(GameMsg::LogicEntityComplete {
            uid: EntityUid(7),
            attached: None,
            class: "teleporter_mk9".into(),
            pos: WirePos::from_vec3(Vec3::new(10.0, 10.0, 10.0)),
            state_data: "{}".into(),
        })
        .unwrap();
        assert_eq!(
            s.world().entity(EntityUid(7)).unwrap().kind,
            EntityKind::Marker
        );
    }

    #[test]
    fn prepare_drops_replica_and_requests_scenario() {
        let mut s = session();
        s.handle(complete(5, Vec3::new(100.0, 100.0, 100.0))).unwrap();
        s.handle(GameMsg::PrepareForNewScenario).unwrap();
        assert_eq!(s.world().entity_count(), 0);
        assert_eq!(s.sync_state(), SyncState::NoScenario);
        assert_eq!(s.take_outbox(), vec![GameMsg::RequestCurrentScenario]);
    }

    #[test]
    fn state_change_requests_carry_scenario_code() {
        let mut s = session();
        s.handle(complete(5, Vec3::new(100.0, 100.0, 100.0))).unwrap();
        s.request_state_change(EntityUid(5), "attr0", "32", true);
        let out = s.take_outbox();
        assert!(matches!(
            &out[0],
            GameMsg::StateDataRequest { scenario_code, .. } if scenario_code == "abcd"
        ));
    }

    #[test]
    fn repeated_notify_with_same_code_keeps_synced() {
        let mut s = session();
        s.handle(complete(5, Vec3::new(100.0, 100.0, 100.0))).unwrap();
        s.handle(GameMsg::NotifyAboutCurrentScenario {
            map: "m".into(),
            scenario_code: "abcd".into(),
        })
        .unwrap();
        assert_eq!(s.sync_state(), SyncState::Synced);
        // Edits still flow after the duplicate announcement.
        s.request_state_change(EntityUid(5), "attr0", "7", false);
        assert_eq!(s.take_outbox().len(), 1);
        // A genuinely new code does start a resync.
        s.handle(GameMsg::NotifyAboutCurrentScenario {
            map: "m2".into(),
            scenario_code: "ffff".into(),
        })
        .unwrap();
        assert_eq!(s.sync_state(), SyncState::Receiving);
    }

    #[test]
    fn removal_is_ignored_for_unknown_uid() {
        let mut s = session();
        s.handle(GameMsg::LogicEntityRemoval { uid: EntityUid(99) })
            .unwrap();
        assert_eq!(s.world().entity_count(), 0);
    }

    #[test]
    fn state_updates_apply_last_writer_wins() {
        let mut s = session();
        s.handle(complete(5, Vec3::new(100.0, 100.0, 100.0))).unwrap();
        s.handle(GameMsg::UnreliableStateDataUpdate {
            uid: EntityUid(5),
            key: "attr0".into(),
            value: "10".into(),
        })
        .unwrap();
        s.handle(GameMsg::UnreliableStateDataUpdate {
            uid: EntityUid(5),
            key: "attr0".into(),
            value: "20".into(),
        })
        .unwrap();
        assert_eq!(s.world().entity(EntityUid(5)).unwrap().attrs[0], 20);
        s.world().check_index_consistency();
    }
}
