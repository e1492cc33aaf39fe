//! Client network front-end.
//!
//! Owns the two sockets and feeds decoded server messages into the pure
//! `ClientSession`. The scenario request is re-sent on a timer until the
//! entity set arrives, so a client that connects while the server is
//! still preparing converges without any extra handshake state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use octa_shared::{
    config::EngineConfig,
    dispatch::Dispatch,
    proto::{
        Channel, ClientId, GameMsg, ReliableConn, UnreliableConn, PROTOCOL_VERSION,
    },
    script::{RecordingScriptBridge, ScriptBridge},
    world::WorldState,
};
use tokio::{net::TcpStream, time::Instant};
use tracing::{debug, info, warn};

use crate::session::{ClientSession, SyncState};

/// High-level game client.
pub struct GameClient {
    pub client_id: ClientId,
    /// Whether the server granted edit privilege.
    pub admin: bool,
    session: ClientSession,

    reliable: ReliableConn,
    unreliable: UnreliableConn,

    connected: bool,
    /// Retry interval for the scenario request; zero disables retry.
    retry: Duration,
    last_request: Option<Instant>,
}

impl GameClient {
    /// Connects to a server, performs the handshake and queues the first
    /// scenario request.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let script: Box<dyn ScriptBridge + Send> = Box::new(RecordingScriptBridge::new());
        Self::connect_with_script(cfg, script).await
    }

    pub async fn connect_with_script(
        cfg: &EngineConfig,
        script: Box<dyn ScriptBridge + Send>,
    ) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "connecting to server");

        // Bind UDP first so the hello can announce our port.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&GameMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&GameMsg::UdpHello { client_udp_port }).await?;

        let welcome = reliable.recv().await?;
        let (client_id, admin) = match welcome {
            GameMsg::Welcome { client_id, admin } => (client_id, admin),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };
        info!(client_id = client_id.0, admin, "connected to server");

        let world = WorldState::new(cfg.world_size, cfg.world_size_max, cfg.min_entity_radius);
        let mut session = ClientSession::new(world, script);
        session.request_scenario();

        Ok(Self {
            client_id,
            admin,
            session,
            reliable,
            unreliable,
            connected: true,
            retry: Duration::from_millis(cfg.scenario_retry_ms),
            last_request: None,
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession {
        &mut self.session
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_synced(&self) -> bool {
        self.session.sync_state() == SyncState::Synced
    }

    /// Executes one client tick: drain inbound, retry the scenario request
    /// if due, run upkeep, flush requests.
    pub async fn step(&mut self, now_ms: u64) -> anyhow::Result<()> {
        self.poll_reliable().await?;
        self.poll_unreliable().await?;
        self.maybe_retry_scenario();
        self.session.tick(now_ms);
        self.flush_outbox().await?;
        Ok(())
    }

    /// Drains pending reliable frames.
    pub async fn poll_reliable(&mut self) -> anyhow::Result<()> {
        loop {
            match self.reliable.recv_timeout(Duration::from_millis(1)).await {
                Ok(Some(GameMsg::Disconnect { reason })) => {
                    info!(%reason, "disconnected by server");
                    self.connected = false;
                    return Ok(());
                }
                Ok(Some(msg)) => {
                    if self.session.handle(msg)? == Dispatch::NotMine {
                        debug!("unhandled reliable message ignored");
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "reliable connection lost");
                    self.connected = false;
                    return Ok(());
                }
            }
        }
    }

    /// Drains pending datagrams.
    pub async fn poll_unreliable(&mut self) -> anyhow::Result<()> {
        while let Some(msg) = self
            .unreliable
            .recv_timeout(Duration::from_millis(1))
            .await?
        {
            if self.session.handle(msg)? == Dispatch::NotMine {
                debug!("unhandled datagram ignored");
            }
        }
        Ok(())
    }

    /// Re-sends the scenario request until synced. A zero interval keeps
    /// the single initial request and waits indefinitely.
    fn maybe_retry_scenario(&mut self) {
        if self.is_synced() || self.retry.is_zero() {
            return;
        }
        let due = match self.last_request {
            Some(at) => at.elapsed() >= self.retry,
            None => false,
        };
        if due {
            debug!("re-requesting current scenario");
            self.session.request_scenario();
        }
    }

    /// Flushes queued session requests on their delivery channels.
    pub async fn flush_outbox(&mut self) -> anyhow::Result<()> {
        for msg in self.session.take_outbox() {
            if matches!(msg, GameMsg::RequestCurrentScenario) {
                self.last_request = Some(Instant::now());
            }
            match msg.channel() {
                Channel::Reliable => self.reliable.send(&msg).await?,
                // Datagram loss is the contract here.
                Channel::Unreliable => {
                    let _ = self.unreliable.send(&msg).await;
                }
            }
        }
        Ok(())
    }

    /// Announces a clean disconnect.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        self.reliable
            .send(&GameMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await?;
        self.connected = false;
        Ok(())
    }

    pub fn server_peer(&self) -> anyhow::Result<SocketAddr> {
        self.reliable.peer_addr()
    }
}
