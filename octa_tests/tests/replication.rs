//! Replication tests driving both roles in one binary.
//!
//! The sessions are socket-free, so a "network" here is just moving each
//! side's outbox into the other side's handler table. Delivery order per
//! channel is preserved; dropping a message simulates datagram loss.

use octa_client::session::{ClientSession, SyncState};
use octa_server::session::{Outgoing, ServerSession, Target};
use octa_shared::dispatch::Sender;
use octa_shared::entity::EntityKind;
use octa_shared::math::Vec3;
use octa_shared::proto::{ClientId, GameMsg};
use octa_shared::script::RecordingScriptBridge;
use octa_shared::world::WorldState;

fn server() -> ServerSession {
    let world = WorldState::new(1024, 1 << 16, 2.0);
    let mut s = ServerSession::new(world, Box::new(RecordingScriptBridge::new()));
    s.push_scenario("test_map");
    s.activate_scenario();
    s
}

fn client() -> ClientSession {
    let world = WorldState::new(1024, 1 << 16, 2.0);
    ClientSession::new(world, Box::new(RecordingScriptBridge::new()))
}

/// Delivers the server outbox to the given clients, respecting targets.
fn deliver(server: &mut ServerSession, clients: &mut [(ClientId, &mut ClientSession)]) {
    for Outgoing { target, msg } in server.take_outbox() {
        for (id, session) in clients.iter_mut() {
            let hit = match target {
                Target::All => true,
                Target::One(t) => t == *id,
            };
            if hit {
                session.handle(msg.clone()).unwrap();
            }
        }
    }
}

/// Delivers a client's queued requests to the server as `sender`.
fn uplink(client: &mut ClientSession, server: &mut ServerSession, sender: Sender) {
    for msg in client.take_outbox() {
        server.handle(sender, msg).unwrap();
    }
}

fn sync(server: &mut ServerSession, id: ClientId, session: &mut ClientSession) {
    session.request_scenario();
    // The transport triggers the entity stream after a handled scenario
    // request; mirror that here.
    for msg in session.take_outbox() {
        server
            .handle(Sender { client: id, admin: true }, msg)
            .unwrap();
    }
    server.send_all_entities(id);
    deliver(server, &mut [(id, session)]);
    assert_eq!(session.sync_state(), SyncState::Synced);
    // The prepare announcement queued a scenario request of its own;
    // drop it so tests start from an empty request outbox.
    session.take_outbox();
}

#[test]
fn admin_creation_replicates_to_every_client() {
    let mut srv = server();
    let mut a = client();
    let mut b = client();
    sync(&mut srv, ClientId(1), &mut a);
    sync(&mut srv, ClientId(2), &mut b);

    a.request_new_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "");
    uplink(&mut a, &mut srv, Sender { client: ClientId(1), admin: true });
    deliver(&mut srv, &mut [(ClientId(1), &mut a), (ClientId(2), &mut b)]);

    assert_eq!(srv.world().entity_count(), 1);
    assert_eq!(a.world().entity_count(), 1);
    assert_eq!(b.world().entity_count(), 1);
    let uid = srv.world().entities().next().unwrap().uid;
    assert_eq!(a.world().entity(uid).unwrap().kind, EntityKind::Light);
    a.world().check_index_consistency();
    b.world().check_index_consistency();
}

#[test]
fn non_admin_request_produces_no_broadcast() {
    let mut srv = server();
    let mut a = client();
    let mut b = client();
    sync(&mut srv, ClientId(1), &mut a);
    sync(&mut srv, ClientId(2), &mut b);

    a.request_new_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "");
    uplink(&mut a, &mut srv, Sender { client: ClientId(1), admin: false });
    deliver(&mut srv, &mut [(ClientId(1), &mut a), (ClientId(2), &mut b)]);

    assert_eq!(srv.world().entity_count(), 0);
    assert_eq!(a.world().entity_count(), 0);
    assert_eq!(b.world().entity_count(), 0);
}

#[test]
fn duplicate_complete_notification_is_idempotent() {
    let mut srv = server();
    let mut a = client();
    sync(&mut srv, ClientId(1), &mut a);

    let uid = srv
        .core_mut()
        .create_entity("mapmodel", Vec3::new(64.0, 64.0, 64.0), "{}", "")
        .unwrap();
    let out = srv.take_outbox();
    assert_eq!(out.len(), 1);
    // Reliable resend of the same notification (reconnect refresh path).
    a.handle(out[0].msg.clone()).unwrap();
    a.handle(out[0].msg.clone()).unwrap();

    assert_eq!(a.world().entity_count(), 1);
    assert!(a.world().entity(uid).is_some());
    a.world().check_index_consistency();
}

#[test]
fn stale_scenario_request_is_dropped_without_error() {
    let mut srv = server();
    let mut a = client();
    sync(&mut srv, ClientId(1), &mut a);

    let uid = srv
        .core_mut()
        .create_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "")
        .unwrap();
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);

    // The client queues a change, then the server moves on to a new
    // scenario before the request arrives.
    a.request_state_change(uid, "attr0", "99", true);
    srv.push_scenario("next_map");
    srv.activate_scenario();

    uplink(&mut a, &mut srv, Sender { client: ClientId(1), admin: true });
    // Nothing beyond the scenario-switch traffic itself is broadcast.
    let extra: Vec<_> = srv
        .take_outbox()
        .into_iter()
        .filter(|o| matches!(o.msg, GameMsg::StateDataUpdate { .. }))
        .collect();
    assert!(extra.is_empty(), "stale request must not be echoed");
}

#[test]
fn unreliable_updates_are_last_writer_wins() {
    let mut srv = server();
    let mut a = client();
    sync(&mut srv, ClientId(1), &mut a);

    let uid = srv
        .core_mut()
        .create_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "")
        .unwrap();
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);

    a.request_state_change(uid, "attr0", "10", false);
    a.request_state_change(uid, "attr0", "30", false);
    uplink(&mut a, &mut srv, Sender { client: ClientId(1), admin: true });
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);

    assert_eq!(srv.world().entity(uid).unwrap().attrs[0], 30);
    assert_eq!(a.world().entity(uid).unwrap().attrs[0], 30);

    // A dropped datagram in the middle changes nothing about the end state.
    a.request_state_change(uid, "attr0", "40", false);
    a.request_state_change(uid, "attr0", "50", false);
    let mut msgs = a.take_outbox();
    msgs.remove(0); // the "40" is lost on the wire
    for msg in msgs {
        srv.handle(Sender { client: ClientId(1), admin: true }, msg)
            .unwrap();
    }
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);
    assert_eq!(a.world().entity(uid).unwrap().attrs[0], 50);
}

#[test]
fn scenario_switch_resyncs_clients_from_scratch() {
    let mut srv = server();
    let mut a = client();
    sync(&mut srv, ClientId(1), &mut a);

    srv.core_mut()
        .create_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "")
        .unwrap();
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);
    assert_eq!(a.world().entity_count(), 1);
    let old_code = a.scenario_code().to_string();

    srv.push_scenario("second_map");
    srv.core_mut()
        .create_entity("sound", Vec3::new(50.0, 50.0, 50.0), "{}", "")
        .unwrap();
    srv.activate_scenario();
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);

    // Prepare dropped the replica and queued a fresh scenario request.
    uplink(&mut a, &mut srv, Sender { client: ClientId(1), admin: true });
    srv.send_all_entities(ClientId(1));
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);

    assert_eq!(a.sync_state(), SyncState::Synced);
    assert_ne!(a.scenario_code(), old_code);
    assert_eq!(a.world().entity_count(), 1);
    assert_eq!(
        a.world().entities().next().unwrap().kind,
        EntityKind::Sound
    );
    a.world().check_index_consistency();
}

#[test]
fn removal_replicates_and_clears_replica_index() {
    let mut srv = server();
    let mut a = client();
    sync(&mut srv, ClientId(1), &mut a);

    let uid = srv
        .core_mut()
        .create_entity("mapmodel", Vec3::new(64.0, 64.0, 64.0), "{}", "")
        .unwrap();
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);
    assert_eq!(a.world().entity_count(), 1);

    a.request_removal(uid);
    uplink(&mut a, &mut srv, Sender { client: ClientId(1), admin: true });
    deliver(&mut srv, &mut [(ClientId(1), &mut a)]);

    assert_eq!(srv.world().entity_count(), 0);
    assert_eq!(a.world().entity_count(), 0);
    assert!(a.world().visible_leaves().is_empty());
    assert_eq!(a.world().entity(uid), None);
}
