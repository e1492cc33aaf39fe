//! In-process soak runner.
//!
//! Drives a server session and two client replicas through thousands of
//! randomized edit cycles (create, move, retune, remove, scenario switch)
//! and verifies the spatial index and both replicas after every batch.
//!
//! Usage:
//!   cargo run -p octa_tests --bin soak_runner -- [iterations]

use std::time::Instant;

use octa_client::session::{ClientSession, SyncState};
use octa_server::session::{Outgoing, ServerSession, Target};
use octa_shared::dispatch::Sender;
use octa_shared::entity::EntityUid;
use octa_shared::math::Vec3;
use octa_shared::proto::ClientId;
use octa_shared::script::RecordingScriptBridge;
use octa_shared::world::WorldState;

const CLASSES: &[&str] = &["light", "mapmodel", "sound", "particles", "marker", "decal"];

fn deliver(server: &mut ServerSession, clients: &mut [(ClientId, ClientSession)]) {
    for Outgoing { target, msg } in server.take_outbox() {
        for (id, session) in clients.iter_mut() {
            let hit = match target {
                Target::All => true,
                Target::One(t) => t == *id,
            };
            if hit {
                session.handle(msg.clone()).expect("client dispatch");
            }
        }
    }
}

fn sync_all(server: &mut ServerSession, clients: &mut [(ClientId, ClientSession)]) {
    let ids: Vec<ClientId> = clients.iter().map(|(id, _)| *id).collect();
    for id in ids {
        server
            .handle(
                Sender {
                    client: id,
                    admin: true,
                },
                octa_shared::proto::GameMsg::RequestCurrentScenario,
            )
            .expect("scenario request");
        server.send_all_entities(id);
    }
    deliver(server, clients);
    // Prepare handling queues a scenario request per client; those are
    // already answered above, so drop them.
    for (_, c) in clients.iter_mut() {
        c.take_outbox();
    }
}

/// xorshift is plenty for a soak; no distribution requirements here.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn main() {
    let iterations: u64 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(5000);

    println!("octa soak runner: {iterations} iterations");
    let started = Instant::now();

    let world = WorldState::new(1024, 1 << 16, 2.0);
    let mut server = ServerSession::new(world, Box::new(RecordingScriptBridge::new()));
    server.push_scenario("soak_map");
    server.activate_scenario();

    let mut clients: Vec<(ClientId, ClientSession)> = (1..=2)
        .map(|i| {
            (
                ClientId(i),
                ClientSession::new(
                    WorldState::new(1024, 1 << 16, 2.0),
                    Box::new(RecordingScriptBridge::new()),
                ),
            )
        })
        .collect();
    deliver(&mut server, &mut clients);
    sync_all(&mut server, &mut clients);

    let mut rng = Rng(0x9e3779b97f4a7c15);
    let mut created: u64 = 0;
    let mut removed: u64 = 0;
    let mut edits: u64 = 0;
    let mut switches: u64 = 0;

    for i in 0..iterations {
        let uids: Vec<EntityUid> = server.world().entities().map(|e| e.uid).collect();
        match rng.below(100) {
            // Creation stays the common case so the set grows.
            0..=39 => {
                let class = CLASSES[rng.below(CLASSES.len() as u64) as usize];
                let pos = Vec3::new(
                    rng.below(1024) as f32,
                    rng.below(1024) as f32,
                    rng.below(1024) as f32,
                );
                server
                    .core_mut()
                    .create_entity(class, pos, "{}", "")
                    .expect("create");
                created += 1;
            }
            40..=69 if !uids.is_empty() => {
                let uid = uids[rng.below(uids.len() as u64) as usize];
                let pos = format!(
                    "{} {} {}",
                    rng.below(1024),
                    rng.below(1024),
                    rng.below(1024)
                );
                server.core_mut().mutate_state(uid, "position", &pos, None, true);
                edits += 1;
            }
            70..=89 if !uids.is_empty() => {
                let uid = uids[rng.below(uids.len() as u64) as usize];
                let value = rng.below(256).to_string();
                server.core_mut().mutate_state(uid, "attr0", &value, None, false);
                edits += 1;
            }
            90..=97 if !uids.is_empty() => {
                let uid = uids[rng.below(uids.len() as u64) as usize];
                server.core_mut().destroy_entity(uid);
                removed += 1;
            }
            _ => {
                server.push_scenario("soak_map");
                server.activate_scenario();
                deliver(&mut server, &mut clients);
                sync_all(&mut server, &mut clients);
                switches += 1;
            }
        }
        deliver(&mut server, &mut clients);

        if i % 500 == 0 {
            server.world().check_index_consistency();
            for (_, c) in &clients {
                assert_eq!(c.sync_state(), SyncState::Synced);
                c.world().check_index_consistency();
                assert_eq!(
                    c.world().entity_count(),
                    server.world().entity_count(),
                    "replica diverged at iteration {i}"
                );
            }
        }
    }

    server.world().check_index_consistency();
    for (_, c) in &clients {
        c.world().check_index_consistency();
        assert_eq!(c.world().entity_count(), server.world().entity_count());
    }

    println!("done in {:.2}s", started.elapsed().as_secs_f64());
    println!("  created:  {created}");
    println!("  edited:   {edits}");
    println!("  removed:  {removed}");
    println!("  switches: {switches}");
    println!("  final entity count: {}", server.world().entity_count());
}
