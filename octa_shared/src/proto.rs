//! Replication protocol.
//!
//! Goals:
//! - Provide a simple reliable (TCP) and unreliable (UDP) channel.
//! - Provide the typed message catalog with stable per-type codes.
//! - Keep serialization explicit and versionable.
//!
//! Reliable-ordered carries entity creation/removal and the scenario
//! handshake; unreliable-unordered carries continuous state whose
//! staleness is self-correcting (last writer wins, no sequence numbers).

use anyhow::Context;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use crate::entity::EntityUid;
use crate::math::Vec3;

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed-point scale for positions on the wire.
pub const DMF: f32 = 16.0;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Delivery class a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// Position quantized for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl WirePos {
    pub fn from_vec3(v: Vec3) -> Self {
        Self {
            x: (v.x * DMF).round() as i32,
            y: (v.y * DMF).round() as i32,
            z: (v.z * DMF).round() as i32,
        }
    }

    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(self.x as f32 / DMF, self.y as f32 / DMF, self.z as f32 / DMF)
    }
}

// ─── Message type codes ───
pub const MSG_HELLO: u32 = 1001;
pub const MSG_UDP_HELLO: u32 = 1002;
pub const MSG_WELCOME: u32 = 1003;
pub const MSG_DISCONNECT: u32 = 1004;
pub const MSG_REQUEST_CURRENT_SCENARIO: u32 = 1005;
pub const MSG_PREPARE_FOR_NEW_SCENARIO: u32 = 1006;
pub const MSG_NOTIFY_ABOUT_CURRENT_SCENARIO: u32 = 1007;
pub const MSG_ALL_ACTIVE_ENTITIES_SENT: u32 = 1008;
pub const MSG_NEW_ENTITY_REQUEST: u32 = 1010;
pub const MSG_LOGIC_ENTITY_COMPLETE: u32 = 1011;
pub const MSG_REQUEST_ENTITY_REMOVAL: u32 = 1012;
pub const MSG_LOGIC_ENTITY_REMOVAL: u32 = 1013;
pub const MSG_STATE_DATA_REQUEST: u32 = 1014;
pub const MSG_STATE_DATA_UPDATE: u32 = 1015;
pub const MSG_UNRELIABLE_STATE_DATA_REQUEST: u32 = 1016;
pub const MSG_UNRELIABLE_STATE_DATA_UPDATE: u32 = 1017;

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GameMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        client_id: ClientId,
        /// Whether the server grants this client edit/admin privilege.
        admin: bool,
    },
    Disconnect {
        reason: String,
    },

    // ─── Scenario handshake ───
    /// Client asks for the current scenario (map + entity set).
    RequestCurrentScenario,
    /// Server is about to switch scenarios; client should drop world state.
    PrepareForNewScenario,
    /// Server names the active scenario.
    NotifyAboutCurrentScenario {
        map: String,
        scenario_code: String,
    },
    /// Server finished streaming the active entity set.
    AllActiveEntitiesSent,

    // ─── Entity replication ───
    /// Client (admin) asks the server to create an entity.
    NewEntityRequest {
        class: String,
        pos: WirePos,
        state_data: String,
        extra: String,
    },
    /// Server notifies clients of a complete entity (creation or refresh).
    LogicEntityComplete {
        uid: EntityUid,
        attached: Option<EntityUid>,
        class: String,
        pos: WirePos,
        state_data: String,
    },
    /// Client (admin) asks the server to remove an entity.
    RequestEntityRemoval {
        uid: EntityUid,
    },
    /// Server removes an entity on clients.
    LogicEntityRemoval {
        uid: EntityUid,
    },

    // ─── State data ───
    /// Client requests a state-data change; stamped with the scenario code
    /// so stale-session requests can be dropped.
    StateDataRequest {
        uid: EntityUid,
        key: String,
        value: String,
        scenario_code: String,
    },
    /// Server-confirmed state-data change.
    StateDataUpdate {
        uid: EntityUid,
        key: String,
        value: String,
        originator: Option<ClientId>,
    },
    /// Unreliable flavors for continuous, self-correcting state.
    UnreliableStateDataRequest {
        uid: EntityUid,
        key: String,
        value: String,
        scenario_code: String,
    },
    UnreliableStateDataUpdate {
        uid: EntityUid,
        key: String,
        value: String,
    },
}

impl GameMsg {
    /// Stable type code, globally unique across the catalog.
    pub fn type_code(&self) -> u32 {
        match self {
            GameMsg::Hello { .. } => MSG_HELLO,
            GameMsg::UdpHello { .. } => MSG_UDP_HELLO,
            GameMsg::Welcome { .. } => MSG_WELCOME,
            GameMsg::Disconnect { .. } => MSG_DISCONNECT,
            GameMsg::RequestCurrentScenario => MSG_REQUEST_CURRENT_SCENARIO,
            GameMsg::PrepareForNewScenario => MSG_PREPARE_FOR_NEW_SCENARIO,
            GameMsg::NotifyAboutCurrentScenario { .. } => MSG_NOTIFY_ABOUT_CURRENT_SCENARIO,
            GameMsg::AllActiveEntitiesSent => MSG_ALL_ACTIVE_ENTITIES_SENT,
            GameMsg::NewEntityRequest { .. } => MSG_NEW_ENTITY_REQUEST,
            GameMsg::LogicEntityComplete { .. } => MSG_LOGIC_ENTITY_COMPLETE,
            GameMsg::RequestEntityRemoval { .. } => MSG_REQUEST_ENTITY_REMOVAL,
            GameMsg::LogicEntityRemoval { .. } => MSG_LOGIC_ENTITY_REMOVAL,
            GameMsg::StateDataRequest { .. } => MSG_STATE_DATA_REQUEST,
            GameMsg::StateDataUpdate { .. } => MSG_STATE_DATA_UPDATE,
            GameMsg::UnreliableStateDataRequest { .. } => MSG_UNRELIABLE_STATE_DATA_REQUEST,
            GameMsg::UnreliableStateDataUpdate { .. } => MSG_UNRELIABLE_STATE_DATA_UPDATE,
        }
    }

    /// Diagnostic name.
    pub fn type_name(&self) -> &'static str {
        match self {
            GameMsg::Hello { .. } => "Hello",
            GameMsg::UdpHello { .. } => "UdpHello",
            GameMsg::Welcome { .. } => "Welcome",
            GameMsg::Disconnect { .. } => "Disconnect",
            GameMsg::RequestCurrentScenario => "RequestCurrentScenario",
            GameMsg::PrepareForNewScenario => "PrepareForNewScenario",
            GameMsg::NotifyAboutCurrentScenario { .. } => "NotifyAboutCurrentScenario",
            GameMsg::AllActiveEntitiesSent => "AllActiveEntitiesSent",
            GameMsg::NewEntityRequest { .. } => "NewEntityRequest",
            GameMsg::LogicEntityComplete { .. } => "LogicEntityComplete",
            GameMsg::RequestEntityRemoval { .. } => "RequestEntityRemoval",
            GameMsg::LogicEntityRemoval { .. } => "LogicEntityRemoval",
            GameMsg::StateDataRequest { .. } => "StateDataRequest",
            GameMsg::StateDataUpdate { .. } => "StateDataUpdate",
            GameMsg::UnreliableStateDataRequest { .. } => "UnreliableStateDataRequest",
            GameMsg::UnreliableStateDataUpdate { .. } => "UnreliableStateDataUpdate",
        }
    }

    /// Delivery class this message travels on.
    pub fn channel(&self) -> Channel {
        match self {
            GameMsg::UnreliableStateDataRequest { .. }
            | GameMsg::UnreliableStateDataUpdate { .. } => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }
}

/// Reliable connection over TCP with length-prefixed frames.
///
/// Inbound bytes accumulate in a buffer and frames are cut from it, so a
/// partially received frame survives any number of timed-out polls; the
/// stream never loses framing.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
    rx: BytesMut,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            rx: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub async fn send(&mut self, msg: &GameMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    /// Cuts one complete frame from the receive buffer, if present.
    fn take_frame(&mut self) -> anyhow::Result<Option<GameMsg>> {
        if self.rx.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.rx[0], self.rx[1], self.rx[2], self.rx[3]]) as usize;
        if self.rx.len() < 4 + len {
            return Ok(None);
        }
        self.rx.advance(4);
        let payload = self.rx.split_to(len);
        let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
        Ok(Some(msg))
    }

    pub async fn recv(&mut self) -> anyhow::Result<GameMsg> {
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(msg);
            }
            let n = self
                .stream
                .read_buf(&mut self.rx)
                .await
                .context("tcp read")?;
            anyhow::ensure!(n > 0, "connection closed");
        }
    }

    /// Polls for a frame within the given timeout. `read_buf` either
    /// appends bytes or does nothing when the timeout cancels it, so
    /// partial frames stay buffered across calls.
    pub async fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<GameMsg>> {
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(Some(msg));
            }
            match time::timeout(timeout, self.stream.read_buf(&mut self.rx)).await {
                Ok(Ok(0)) => anyhow::bail!("connection closed"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e).context("tcp read"),
                Err(_) => return Ok(None),
            }
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &GameMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<GameMsg> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
        Ok(msg)
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<GameMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &GameMsg) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(msg).context("serialize")
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<GameMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamemsg_roundtrip_bytes() {
        let msg = GameMsg::NewEntityRequest {
            class: "light".into(),
            pos: WirePos::from_vec3(Vec3::new(100.0, 100.0, 100.0)),
            state_data: "{}".into(),
            extra: String::new(),
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let back = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn type_codes_are_unique() {
        let msgs = vec![
            GameMsg::Hello { protocol: 1 },
            GameMsg::UdpHello { client_udp_port: 0 },
            GameMsg::Welcome {
                client_id: ClientId(1),
                admin: false,
            },
            GameMsg::Disconnect {
                reason: String::new(),
            },
            GameMsg::RequestCurrentScenario,
            GameMsg::PrepareForNewScenario,
            GameMsg::NotifyAboutCurrentScenario {
                map: String::new(),
                scenario_code: String::new(),
            },
            GameMsg::AllActiveEntitiesSent,
            GameMsg::NewEntityRequest {
                class: String::new(),
                pos: WirePos { x: 0, y: 0, z: 0 },
                state_data: String::new(),
                extra: String::new(),
            },
            GameMsg::LogicEntityComplete {
                uid: EntityUid(1),
                attached: None,
                class: String::new(),
                pos: WirePos { x: 0, y: 0, z: 0 },
                state_data: String::new(),
            },
            GameMsg::RequestEntityRemoval { uid: EntityUid(1) },
            GameMsg::LogicEntityRemoval { uid: EntityUid(1) },
            GameMsg::StateDataRequest {
                uid: EntityUid(1),
                key: String::new(),
                value: String::new(),
                scenario_code: String::new(),
            },
            GameMsg::StateDataUpdate {
                uid: EntityUid(1),
                key: String::new(),
                value: String::new(),
                originator: None,
            },
            GameMsg::UnreliableStateDataRequest {
                uid: EntityUid(1),
                key: String::new(),
                value: String::new(),
                scenario_code: String::new(),
            },
            GameMsg::UnreliableStateDataUpdate {
                uid: EntityUid(1),
                key: String::new(),
                value: String::new(),
            },
        ];
        let mut codes: Vec<u32> = msgs.iter().map(|m| m.type_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), msgs.len(), "duplicate type code in catalog");
    }

    #[test]
    fn wire_position_quantizes_at_dmf() {
        let pos = Vec3::new(100.25, -3.5, 0.0625);
        let wire = WirePos::from_vec3(pos);
        assert_eq!(wire.to_vec3(), pos);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn split_frame_survives_timed_out_polls() {
        use std::time::Duration;

        let listener = ReliableListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = serde_json::to_vec(&GameMsg::RequestCurrentScenario).unwrap();
            let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
            framed.extend_from_slice(&payload);
            // Split mid-prefix with a pause, so short polls on the reader
            // side expire while the frame is in flight.
            stream.write_all(&framed[..3]).await.unwrap();
            stream.flush().await.unwrap();
            time::sleep(Duration::from_millis(50)).await;
            stream.write_all(&framed[3..]).await.unwrap();
            stream.flush().await.unwrap();
            time::sleep(Duration::from_millis(200)).await;
        });
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut got = None;
        for _ in 0..500 {
            if let Some(msg) = conn.recv_timeout(Duration::from_millis(1)).await.unwrap() {
                got = Some(msg);
                break;
            }
        }
        assert_eq!(got, Some(GameMsg::RequestCurrentScenario));
        writer.await.unwrap();
    }

    #[test]
    fn unreliable_variants_use_unreliable_channel() {
        let m = GameMsg::UnreliableStateDataUpdate {
            uid: EntityUid(1),
            key: "pos".into(),
            value: String::new(),
        };
        assert_eq!(m.channel(), Channel::Unreliable);
        assert_eq!(
            GameMsg::RequestCurrentScenario.channel(),
            Channel::Reliable
        );
    }
}
