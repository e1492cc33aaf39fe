//! `octa_shared`
//!
//! Shared world core used by both client and server.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (octree, entities, lights, proto).
//! - Explicit ownership: all mutable world state hangs off `WorldState`.
//! - No `unsafe`.

pub mod bounds;
pub mod config;
pub mod dispatch;
pub mod dynlight;
pub mod entity;
pub mod math;
pub mod octree;
pub mod persist;
pub mod proto;
pub mod script;
pub mod selection;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::dispatch::*;
    pub use crate::entity::*;
    pub use crate::math::*;
    pub use crate::proto::*;
    pub use crate::world::*;
}
