//! Server network front-end.
//!
//! Owns the sockets and the connected-client table and feeds decoded
//! messages into the pure `ServerSession`. The loop is tick-based:
//! - drain console commands
//! - drain per-client reliable frames and the shared UDP socket
//! - run session upkeep
//! - flush the session outbox on the channel each message asks for
//!
//! Stable iteration order matters when flushing broadcasts, so client
//! ids are sorted before each flush.

use anyhow::Context;
use octa_shared::{
    config::EngineConfig,
    dispatch::{Dispatch, Sender},
    proto::{ClientId, Channel, GameMsg, ReliableConn, ReliableListener, PROTOCOL_VERSION},
    script::{RecordingScriptBridge, ScriptBridge},
    world::WorldState,
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::session::{Outgoing, ScenarioState, ServerSession, Target};

/// A connecting client must complete the hello exchange within this
/// window or the slot is refused; the tick loop never waits longer.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected client state.
struct ClientSlot {
    reliable: ReliableConn,
    udp_peer: SocketAddr,
    admin: bool,
    /// Set once the client has received the full entity set.
    synced: bool,
}

/// Game server: sockets plus the authoritative session.
pub struct GameServer {
    pub cfg: EngineConfig,
    session: ServerSession,
    clients: HashMap<ClientId, ClientSlot>,

    tcp: ReliableListener,
    udp: UdpSocket,

    tick: u64,
    start: Instant,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Binds sockets and wraps a fresh session around `cfg`'s world.
    pub async fn bind(cfg: EngineConfig) -> anyhow::Result<Self> {
        let script: Box<dyn ScriptBridge + Send> = Box::new(RecordingScriptBridge::new());
        Self::bind_with_script(cfg, script).await
    }

    pub async fn bind_with_script(
        cfg: EngineConfig,
        script: Box<dyn ScriptBridge + Send>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;
        let world = WorldState::new(cfg.world_size, cfg.world_size_max, cfg.min_entity_radius);
        Ok(Self {
            cfg,
            session: ServerSession::new(world, script),
            clients: HashMap::new(),
            tcp,
            udp,
            tick: 0,
            start: Instant::now(),
            console_rx: None,
        })
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ServerSession {
        &mut self.session
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Switches to a new scenario and activates it immediately. Entities
    /// are seeded by the caller (console `load`, tests) between push and
    /// activate when a staged set is wanted.
    pub fn start_scenario(&mut self, map: &str) {
        self.session.push_scenario(map);
        self.session.activate_scenario();
        for slot in self.clients.values_mut() {
            slot.synced = false;
        }
    }

    /// Accepts a client with timeout; returns `None` when nobody knocked.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.handle_new_connection(conn, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut conn: ReliableConn,
        peer: SocketAddr,
    ) -> anyhow::Result<ClientId> {
        let msg = conn
            .recv_timeout(HANDSHAKE_TIMEOUT)
            .await?
            .context("handshake timed out waiting for hello")?;
        let GameMsg::Hello { protocol } = msg else {
            anyhow::bail!("unexpected handshake msg: {msg:?}");
        };
        anyhow::ensure!(
            protocol == PROTOCOL_VERSION,
            "protocol mismatch: client {protocol}, server {PROTOCOL_VERSION}"
        );
        let udp_hello = conn
            .recv_timeout(HANDSHAKE_TIMEOUT)
            .await?
            .context("handshake timed out waiting for udp hello")?;
        let client_udp_port = match udp_hello {
            GameMsg::UdpHello { client_udp_port } => client_udp_port,
            other => anyhow::bail!("expected UdpHello, got {other:?}"),
        };

        let id = ClientId::new_unique();
        // Single-session editing server: every connected client gets edit
        // privilege. A lobby front-end would gate this instead.
        let admin = true;
        conn.send(&GameMsg::Welcome {
            client_id: id,
            admin,
        })
        .await?;

        let udp_peer = SocketAddr::new(peer.ip(), client_udp_port);
        self.clients.insert(
            id,
            ClientSlot {
                reliable: conn,
                udp_peer,
                admin,
                synced: false,
            },
        );
        info!(client_id = id.0, %udp_peer, admin, "client connected");
        Ok(id)
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz as f32);
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one server tick.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands()?;
        self.recv_reliable().await?;
        self.recv_unreliable().await?;
        self.session.tick(self.now_ms());
        self.flush_outbox().await?;
        self.tick += 1;
        Ok(())
    }

    fn process_console_commands(&mut self) -> anyhow::Result<()> {
        let lines: Vec<String> = match self.console_rx {
            Some(ref mut rx) => {
                let mut collected = Vec::new();
                while let Ok(line) = rx.try_recv() {
                    collected.push(line);
                }
                collected
            }
            None => Vec::new(),
        };
        for line in lines {
            for out in self.exec_console(&line)? {
                println!("{out}");
            }
        }
        Ok(())
    }

    /// Executes a console command line.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };
        match cmd {
            "map" => {
                if tokens.len() < 2 {
                    return Ok(vec!["Usage: map <mapname>".to_string()]);
                }
                self.start_scenario(tokens[1]);
                Ok(vec![format!("scenario '{}' active", tokens[1])])
            }
            "save" => {
                let name = self.session.map_name().to_string();
                let json = octa_shared::persist::export_world(self.session.world(), &name)?;
                let path = format!("{name}.entities.json");
                std::fs::write(&path, json).with_context(|| format!("write {path}"))?;
                Ok(vec![format!("saved {path}")])
            }
            "status" => {
                let mut out = Vec::new();
                out.push(format!("scenario: {:?}", self.session.scenario()));
                out.push(format!("tick: {}", self.tick));
                out.push(format!("entities: {}", self.session.world().entity_count()));
                out.push(format!("clients: {}", self.clients.len()));
                for (id, slot) in &self.clients {
                    out.push(format!(
                        "  {}: udp={} admin={} synced={}",
                        id.0, slot.udp_peer, slot.admin, slot.synced
                    ));
                }
                Ok(out)
            }
            "quit" | "exit" => {
                info!("server shutting down");
                std::process::exit(0);
            }
            other => Ok(vec![format!("unknown command '{other}'")]),
        }
    }

    /// Drains pending reliable frames from every client.
    async fn recv_reliable(&mut self) -> anyhow::Result<()> {
        let mut inbound: Vec<(ClientId, GameMsg)> = Vec::new();
        let mut dropped: Vec<ClientId> = Vec::new();

        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        for id in ids {
            let Some(slot) = self.clients.get_mut(&id) else {
                continue;
            };
            loop {
                match slot.reliable.recv_timeout(Duration::from_millis(1)).await {
                    Ok(Some(GameMsg::Disconnect { reason })) => {
                        info!(client_id = id.0, %reason, "client disconnected");
                        dropped.push(id);
                        break;
                    }
                    Ok(Some(msg)) => inbound.push((id, msg)),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(client_id = id.0, error = %e, "reliable channel lost");
                        dropped.push(id);
                        break;
                    }
                }
            }
        }
        for id in dropped {
            self.clients.remove(&id);
        }
        for (id, msg) in inbound {
            self.dispatch_from(id, msg)?;
        }
        Ok(())
    }

    /// Drains the shared UDP socket, mapping datagrams to clients by their
    /// announced UDP endpoint.
    async fn recv_unreliable(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    let Ok(msg) = serde_json::from_slice::<GameMsg>(&buf[..n]) else {
                        debug!(%from, "undecodable datagram dropped");
                        continue;
                    };
                    let Some(id) = self
                        .clients
                        .iter()
                        .find(|(_, s)| s.udp_peer == from)
                        .map(|(id, _)| *id)
                    else {
                        debug!(%from, "datagram from unknown endpoint dropped");
                        continue;
                    };
                    self.dispatch_from(id, msg)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv")?,
            }
        }
        Ok(())
    }

    fn dispatch_from(&mut self, id: ClientId, msg: GameMsg) -> anyhow::Result<()> {
        let admin = self.clients.get(&id).map(|s| s.admin).unwrap_or(false);
        let request_scenario = msg.type_code() == octa_shared::proto::MSG_REQUEST_CURRENT_SCENARIO;
        let sender = Sender { client: id, admin };
        match self.session.handle(sender, msg)? {
            Dispatch::Handled => {
                // A scenario request while active also triggers the full
                // entity-set stream, ending with the sent-all sentinel.
                if request_scenario && self.session.scenario() == ScenarioState::Active {
                    self.session.send_all_entities(id);
                    if let Some(slot) = self.clients.get_mut(&id) {
                        slot.synced = true;
                    }
                }
            }
            Dispatch::NotMine => {
                debug!(client_id = id.0, "unhandled message ignored");
            }
        }
        Ok(())
    }

    /// Flushes queued session messages on their delivery channels.
    async fn flush_outbox(&mut self) -> anyhow::Result<()> {
        let outbox = self.session.take_outbox();
        if outbox.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort_by_key(|id| id.0);

        let mut dropped: Vec<ClientId> = Vec::new();
        for Outgoing { target, msg } in outbox {
            let targets: Vec<ClientId> = match target {
                Target::All => ids.clone(),
                Target::One(id) => vec![id],
            };
            for id in targets {
                let Some(slot) = self.clients.get_mut(&id) else {
                    continue;
                };
                match msg.channel() {
                    Channel::Reliable => {
                        if let Err(e) = slot.reliable.send(&msg).await {
                            warn!(client_id = id.0, error = %e, "send failed, dropping client");
                            dropped.push(id);
                        }
                    }
                    Channel::Unreliable => {
                        let payload = octa_shared::proto::encode_to_bytes(&msg)?;
                        // Datagram loss is the contract here.
                        let _ = self.udp.send_to(&payload, slot.udp_peer).await;
                    }
                }
            }
        }
        for id in dropped {
            self.clients.remove(&id);
        }
        Ok(())
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let cfg = EngineConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };

    // Bind TCP first to learn the port, then bind UDP to the same one.
    let tcp = ReliableListener::bind(cfg.server_addr.parse()?).await?;
    let addr = tcp.local_addr()?;
    let mut cfg = cfg;
    cfg.server_addr = addr.to_string();

    let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    let udp = UdpSocket::bind(udp_bind).await?;

    let world = WorldState::new(cfg.world_size, cfg.world_size_max, cfg.min_entity_radius);
    let session = ServerSession::new(world, Box::new(RecordingScriptBridge::new()));

    Ok((
        GameServer {
            cfg: cfg.clone(),
            session,
            clients: HashMap::new(),
            tcp,
            udp,
            tick: 0,
            start: Instant::now(),
            console_rx: None,
        },
        cfg,
    ))
}
