//! Authoritative scenario session.
//!
//! Pure (socket-free) server logic: the scenario state machine, the
//! entity lifecycle (create, mutate, destroy), authority checks, and the
//! outbox of messages for the transport layer to flush. Keeping this free
//! of IO lets both roles run in one test binary.
//!
//! Mutation order is always script -> world (unlink/mutate/relink) ->
//! broadcast; the outbox records broadcasts in that order.

use anyhow::Context;
use tracing::{debug, info, warn};

use octa_shared::dispatch::{Dispatch, HandlerTable, Role, Sender};
use octa_shared::entity::{Entity, EntityKind, EntityUid};
use octa_shared::math::Vec3;
use octa_shared::proto::{
    ClientId, GameMsg, WirePos, MSG_NEW_ENTITY_REQUEST, MSG_REQUEST_CURRENT_SCENARIO,
    MSG_REQUEST_ENTITY_REMOVAL, MSG_STATE_DATA_REQUEST, MSG_UNRELIABLE_STATE_DATA_REQUEST,
};
use octa_shared::script::ScriptBridge;
use octa_shared::world::WorldState;

/// Scenario lifecycle on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    NoScenario,
    /// A new scenario code has been pushed; clients must resync.
    Preparing,
    /// Entity set is live; replication messages flow.
    Active,
}

/// Where an outgoing message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    One(ClientId),
}

/// A message queued for the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub target: Target,
    pub msg: GameMsg,
}

/// Mutable session state the handler table operates on.
pub struct SessionCore {
    pub world: WorldState,
    pub script: Box<dyn ScriptBridge + Send>,
    scenario: ScenarioState,
    scenario_code: String,
    map_name: String,
    outbox: Vec<Outgoing>,
}

impl SessionCore {
    fn queue(&mut self, target: Target, msg: GameMsg) {
        self.outbox.push(Outgoing { target, msg });
    }

    fn complete_notification(&self, ent: &Entity) -> GameMsg {
        GameMsg::LogicEntityComplete {
            uid: ent.uid,
            attached: ent.attached,
            class: ent.kind.class_name().to_string(),
            pos: WirePos::from_vec3(ent.pos),
            state_data: serde_json::to_string(&ent.state_data).unwrap_or_else(|_| "{}".into()),
        }
    }

    /// Creates an entity authoritatively. Unknown classes become marker
    /// placeholders carrying the class name in their state blob.
    pub fn create_entity(
        &mut self,
        class: &str,
        pos: Vec3,
        state_data: &str,
        extra: &str,
    ) -> anyhow::Result<EntityUid> {
        let uid = self.world.alloc_uid();
        if !self
            .script
            .entity_new_with_sd(uid, class, pos.x, pos.y, pos.z, state_data, extra)
        {
            anyhow::bail!("script rejected entity class {class}");
        }
        let kind = EntityKind::from_class(class).unwrap_or(EntityKind::Marker);
        let mut ent = Entity::new(uid, kind, pos);
        if kind == EntityKind::Marker && EntityKind::from_class(class).is_none() {
            ent.state_data.insert("class".into(), class.to_string());
        }
        if let Ok(sdata) = serde_json::from_str::<std::collections::BTreeMap<String, String>>(
            state_data,
        ) {
            for (k, v) in sdata {
                ent.apply_state_kv(&k, &v);
            }
        }
        self.world.add_entity(ent);
        let msg = self
            .world
            .entity(uid)
            .map(|e| self.complete_notification(e))
            .context("entity missing after insert")?;
        self.queue(Target::All, msg);
        info!(uid = uid.0, class, "entity created");
        Ok(uid)
    }

    /// Applies one state-data change and broadcasts it on the requested
    /// delivery class.
    pub fn mutate_state(
        &mut self,
        uid: EntityUid,
        key: &str,
        value: &str,
        originator: Option<ClientId>,
        reliable: bool,
    ) -> bool {
        if !self.world.edit_entity(uid, |e| e.apply_state_kv(key, value)) {
            debug!(uid = uid.0, key, "state change for unknown entity dropped");
            return false;
        }
        if !self.script.entity_set_sdata(uid, key, value, originator) {
            warn!(uid = uid.0, key, "script rejected state change");
        }
        let msg = if reliable {
            GameMsg::StateDataUpdate {
                uid,
                key: key.to_string(),
                value: value.to_string(),
                originator,
            }
        } else {
            GameMsg::UnreliableStateDataUpdate {
                uid,
                key: key.to_string(),
                value: value.to_string(),
            }
        };
        self.queue(Target::All, msg);
        true
    }

    /// Destroys an entity and broadcasts the removal.
    pub fn destroy_entity(&mut self, uid: EntityUid) -> bool {
        if self.world.entity(uid).is_none() {
            return false;
        }
        if !self.script.entity_remove(uid) {
            warn!(uid = uid.0, "script had no record of removed entity");
        }
        self.world.remove_entity(uid);
        self.queue(Target::All, GameMsg::LogicEntityRemoval { uid });
        info!(uid = uid.0, "entity destroyed");
        true
    }
}

/// The authoritative session: state plus the server-role handler table.
pub struct ServerSession {
    core: SessionCore,
    handlers: HandlerTable<SessionCore>,
}

impl ServerSession {
    pub fn new(world: WorldState, script: Box<dyn ScriptBridge + Send>) -> Self {
        let mut handlers = HandlerTable::new(Role::Server);
        handlers.register(MSG_NEW_ENTITY_REQUEST, on_new_entity_request);
        handlers.register(MSG_REQUEST_ENTITY_REMOVAL, on_request_entity_removal);
        handlers.register(MSG_STATE_DATA_REQUEST, on_state_data_request);
        handlers.register(MSG_UNRELIABLE_STATE_DATA_REQUEST, on_state_data_request);
        handlers.register(MSG_REQUEST_CURRENT_SCENARIO, on_request_current_scenario);
        Self {
            core: SessionCore {
                world,
                script,
                scenario: ScenarioState::NoScenario,
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

    pub fn scenario(&self) -> ScenarioState {
        self.core.scenario
    }

    pub fn scenario_code(&self) -> &str {
        &self.core.scenario_code
    }

    pub fn map_name(&self) -> &str {
        &self.core.map_name
    }

    /// Begins a scenario switch: drops the previous entity set, mints a
    /// fresh session code, tells clients to drop world state. The new
    /// entity set is assembled while preparing.
    pub fn push_scenario(&mut self, map: &str) {
        let stale: Vec<EntityUid> = self.core.world.entities().map(|e| e.uid).collect();
        for uid in stale {
            self.core.script.entity_remove(uid);
        }
        let size = self.core.world.world_size();
        self.core.world.reset(size);
        self.core.scenario = ScenarioState::Preparing;
        self.core.scenario_code = new_scenario_code();
        self.core.map_name = map.to_string();
        self.core.queue(Target::All, GameMsg::PrepareForNewScenario);
        info!(map, code = %self.core.scenario_code, "scenario preparing");
    }

    /// Marks the entity set live and announces the scenario.
    pub fn activate_scenario(&mut self) {
        assert_eq!(self.core.scenario, ScenarioState::Preparing);
        self.core.scenario = ScenarioState::Active;
        let msg = GameMsg::NotifyAboutCurrentScenario {
            map: self.core.map_name.clone(),
            scenario_code: self.core.scenario_code.clone(),
        };
        self.core.queue(Target::All, msg);
        info!(map = %self.core.map_name, "scenario active");
    }

    /// Streams the complete active entity set to one client, terminated by
    /// `AllActiveEntitiesSent`.
    pub fn send_all_entities(&mut self, client: ClientId) {
        let msgs: Vec<GameMsg> = self
            .core
            .world
            .entities()
            .filter(|e| e.kind != EntityKind::Empty)
            .map(|e| self.core.complete_notification(e))
            .collect();
        for msg in msgs {
            self.core.queue(Target::One(client), msg);
        }
        self.core
            .queue(Target::One(client), GameMsg::AllActiveEntitiesSent);
    }

    /// Routes an incoming client message through the handler table.
    pub fn handle(&mut self, sender: Sender, msg: GameMsg) -> anyhow::Result<Dispatch> {
        self.handlers
            .dispatch(&mut self.core, sender, msg)
            .context("server dispatch")
    }

    /// Drains queued outgoing messages for the transport layer.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.core.outbox)
    }

    /// Direct access for gameplay/console code.
    pub fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    /// Per-tick upkeep (dynamic lights for now).
    pub fn tick(&mut self, now_ms: u64) {
        self.core.world.tick_lights(now_ms);
    }
}

/// Session codes only need to be unique per server run; 16 random hex
/// digits is plenty.
fn new_scenario_code() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

// ─── Handlers (server role) ───

fn on_new_entity_request(
    core: &mut SessionCore,
    sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let GameMsg::NewEntityRequest {
        class,
        pos,
        state_data,
        extra,
    } = msg
    else {
        unreachable!("registered for NewEntityRequest only");
    };
    if !sender.admin {
        warn!(client = sender.client.0, "non-admin entity creation rejected");
        return Ok(());
    }
    if core.scenario != ScenarioState::Active {
        debug!("entity creation outside active scenario dropped");
        return Ok(());
    }
    if let Err(e) = core.create_entity(&class, pos.to_vec3(), &state_data, &extra) {
        warn!(error = %e, "entity creation failed");
    }
    Ok(())
}

fn on_request_entity_removal(
    core: &mut SessionCore,
    sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let GameMsg::RequestEntityRemoval { uid } = msg else {
        unreachable!("registered for RequestEntityRemoval only");
    };
    if !sender.admin {
        warn!(client = sender.client.0, uid = uid.0, "non-admin removal rejected");
        return Ok(());
    }
    if core.scenario != ScenarioState::Active {
        debug!(uid = uid.0, "removal outside active scenario dropped");
        return Ok(());
    }
    core.destroy_entity(uid);
    Ok(())
}

fn on_state_data_request(
    core: &mut SessionCore,
    sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    let (uid, key, value, scenario_code, reliable) = match msg {
        GameMsg::StateDataRequest {
            uid,
            key,
            value,
            scenario_code,
        } => (uid, key, value, scenario_code, true),
        GameMsg::UnreliableStateDataRequest {
            uid,
            key,
            value,
            scenario_code,
        } => (uid, key, value, scenario_code, false),
        _ => unreachable!("registered for state data requests only"),
    };
    // Stale-session messages are normal reconnection churn, not errors.
    if core.scenario != ScenarioState::Active || scenario_code != core.scenario_code {
        debug!(uid = uid.0, %scenario_code, "stale scenario state change dropped");
        return Ok(());
    }
    core.mutate_state(uid, &key, &value, Some(sender.client), reliable);
    Ok(())
}

fn on_request_current_scenario(
    core: &mut SessionCore,
    sender: Sender,
    msg: GameMsg,
) -> anyhow::Result<()> {
    debug_assert_eq!(msg, GameMsg::RequestCurrentScenario);
    if core.scenario != ScenarioState::Active {
        // Client will retry; nothing to offer yet.
        debug!(client = sender.client.0, "scenario requested before active");
        return Ok(());
    }
    core.queue(
        Target::One(sender.client),
        GameMsg::NotifyAboutCurrentScenario {
            map: core.map_name.clone(),
            scenario_code: core.scenario_code.clone(),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use octa_shared::entity::IndexState;
    use octa_shared::script::RecordingScriptBridge;
    use std::sync::{Arc, Mutex};

    fn session() -> ServerSession {
        let world = WorldState::new(1024, 1 << 16, 2.0);
        let mut s = ServerSession::new(world, Box::new(RecordingScriptBridge::new()));
        s.push_scenario("test_map");
        s.activate_scenario();
        s.take_outbox();
        s
    }

    fn admin() -> Sender {
        Sender {
            client: ClientId(1),
            admin: true,
        }
    }

    fn guest() -> Sender {
        Sender {
            client: ClientId(2),
            admin: false,
        }
    }

    #[test]
    fn create_entity_indexes_and_broadcasts() {
        let mut s = session();
        let uid = s
            .core_mut()
            .create_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "")
            .unwrap();
        let ent = s.world().entity(uid).unwrap();
        assert_eq!(ent.index_state, IndexState::Indexed);
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0].msg,
            GameMsg::LogicEntityComplete { uid: u, .. } if u == uid
        ));
    }

    #[test]
    fn non_admin_creation_is_silently_rejected() {
        let mut s = session();
        let msg = GameMsg::NewEntityRequest {
            class: "light".into(),
            pos: WirePos::from_vec3(Vec3::new(10.0, 10.0, 10.0)),
            state_data: "{}".into(),
            extra: String::new(),
        };
        s.handle(guest(), msg).unwrap();
        assert_eq!(s.world().entity_count(), 0);
        assert!(s.take_outbox().is_empty(), "no broadcast on rejection");
    }

    #[test]
    fn non_admin_removal_is_silently_rejected() {
        let mut s = session();
        let uid = s
            .core_mut()
            .create_entity("light", Vec3::new(10.0, 10.0, 10.0), "{}", "")
            .unwrap();
        s.take_outbox();
        s.handle(guest(), GameMsg::RequestEntityRemoval { uid })
            .unwrap();
        assert!(s.world().entity(uid).is_some());
        assert!(s.take_outbox().is_empty());
    }

    #[test]
    fn stale_scenario_code_is_dropped() {
        let mut s = session();
        let uid = s
            .core_mut()
            .create_entity("light", Vec3::new(10.0, 10.0, 10.0), "{}", "")
            .unwrap();
        s.take_outbox();
        let msg = GameMsg::StateDataRequest {
            uid,
            key: "radius".into(),
            value: "64".into(),
            scenario_code: "0000000000000000".into(),
        };
        s.handle(admin(), msg).unwrap();
        assert!(s.world().entity(uid).unwrap().state_data.get("radius").is_none());
        assert!(s.take_outbox().is_empty());
    }

    #[test]
    fn valid_state_change_mutates_and_broadcasts() {
        let mut s = session();
        let uid = s
            .core_mut()
            .create_entity("light", Vec3::new(10.0, 10.0, 10.0), "{}", "")
            .unwrap();
        s.take_outbox();
        let code = s.scenario_code().to_string();
        let msg = GameMsg::StateDataRequest {
            uid,
            key: "attr0".into(),
            value: "64".into(),
            scenario_code: code,
        };
        s.handle(admin(), msg).unwrap();
        assert_eq!(s.world().entity(uid).unwrap().attrs[0], 64);
        let out = s.take_outbox();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].msg, GameMsg::StateDataUpdate { .. }));
        s.world().check_index_consistency();
    }

    /// Bridge double that exposes the actor of the last sdata call.
    struct ActorTap(Arc<Mutex<Option<ClientId>>>);

    impl ScriptBridge for ActorTap {
        fn entity_new_with_sd(
            &mut self,
            _uid: EntityUid,
            _class: &str,
            _x: f32,
            _y: f32,
            _z: f32,
            _state_data: &str,
            _extra: &str,
        ) -> bool {
            true
        }

        fn entity_remove(&mut self, _uid: EntityUid) -> bool {
            true
        }

        fn entity_set_sdata(
            &mut self,
            _uid: EntityUid,
            _key: &str,
            _value: &str,
            actor: Option<ClientId>,
        ) -> bool {
            *self.0.lock().unwrap() = actor;
            true
        }

        fn entity_set_sdata_full(&mut self, _uid: EntityUid, _blob: &str) -> bool {
            true
        }

        fn entity_exists(&self, _uid: EntityUid) -> bool {
            true
        }

        fn entity_get_proto_name(&self, _uid: EntityUid) -> Option<String> {
            None
        }

        fn entity_serialize_sdata(
            &self,
            _uid: EntityUid,
            _pos: Option<(f32, f32, f32)>,
        ) -> Option<String> {
            None
        }
    }

    #[test]
    fn state_change_forwards_originating_client_to_script() {
        let seen = Arc::new(Mutex::new(None));
        let world = WorldState::new(1024, 1 << 16, 2.0);
        let mut s = ServerSession::new(world, Box::new(ActorTap(Arc::clone(&seen))));
        s.push_scenario("test_map");
        s.activate_scenario();
        s.take_outbox();
        let uid = s
            .core_mut()
            .create_entity("light", Vec3::new(10.0, 10.0, 10.0), "{}", "")
            .unwrap();
        let code = s.scenario_code().to_string();
        s.handle(
            admin(),
            GameMsg::StateDataRequest {
                uid,
                key: "attr0".into(),
                value: "12".into(),
                scenario_code: code,
            },
        )
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(admin().client));
    }

    #[test]
    fn push_scenario_drops_previous_entity_set() {
        let mut s = session();
        s.core_mut()
            .create_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "")
            .unwrap();
        s.take_outbox();

        s.push_scenario("second_map");
        assert_eq!(s.world().entity_count(), 0);
        s.activate_scenario();
        s.send_all_entities(ClientId(1));
        let out = s.take_outbox();
        // Prepare, notify, then the sentinel: no stale entity stream.
        assert!(out
            .iter()
            .all(|o| !matches!(o.msg, GameMsg::LogicEntityComplete { .. })));
        assert!(matches!(
            out.last().map(|o| &o.msg),
            Some(GameMsg::AllActiveEntitiesSent)
        ));
    }

    #[test]
    fn position_change_relinks_octree() {
        let mut s = session();
        let uid = s
            .core_mut()
            .create_entity("light", Vec3::new(10.0, 10.0, 10.0), "{}", "")
            .unwrap();
        s.take_outbox();
        let code = s.scenario_code().to_string();
        s.handle(
            admin(),
            GameMsg::StateDataRequest {
                uid,
                key: "position".into(),
                value: "900 900 900".into(),
                scenario_code: code,
            },
        )
        .unwrap();
        assert_eq!(
            s.world().entity(uid).unwrap().pos,
            Vec3::new(900.0, 900.0, 900.0)
        );
        s.world().check_index_consistency();
    }

    #[test]
    fn send_all_entities_terminates_with_sentinel() {
        let mut s = session();
        for i in 0..3 {
            s.core_mut()
                .create_entity("marker", Vec3::new(10.0 * i as f32 + 10.0, 10.0, 10.0), "{}", "")
                .unwrap();
        }
        s.take_outbox();
        s.send_all_entities(ClientId(9));
        let out = s.take_outbox();
        assert_eq!(out.len(), 4);
        assert!(matches!(out[3].msg, GameMsg::AllActiveEntitiesSent));
        assert!(out
            .iter()
            .all(|o| o.target == Target::One(ClientId(9))));
    }

    #[test]
    fn scenario_request_before_active_is_ignored() {
        let world = WorldState::new(1024, 1 << 16, 2.0);
        let mut s = ServerSession::new(world, Box::new(RecordingScriptBridge::new()));
        s.push_scenario("m");
        s.take_outbox();
        s.handle(guest(), GameMsg::RequestCurrentScenario).unwrap();
        assert!(s.take_outbox().is_empty());
    }
}
