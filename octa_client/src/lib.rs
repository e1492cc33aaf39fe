//! `octa_client`
//!
//! Client-side systems:
//! - World replica mirroring the server's entity set
//! - Scenario handshake with timed retry
//! - Edit requests (create/remove/state) routed to the server
//!
//! Networking model:
//! - TCP: handshake, scenario flow, reliable state data
//! - UDP: unreliable state data (last writer wins)

pub mod client;
pub mod session;

pub use client::GameClient;
pub use session::ClientSession;
