//! `octa_server`
//!
//! Server-side systems:
//! - Authoritative scenario session and entity lifecycle
//! - Admin and scenario-code authority checks
//! - Broadcast outbox flushed over TCP/UDP
//!
//! Networking model:
//! - TCP: handshake, entity creation/removal, reliable state data
//! - UDP: unreliable state data (last writer wins)

pub mod server;
pub mod session;

pub use server::GameServer;
pub use session::ServerSession;
