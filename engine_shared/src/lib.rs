//! `engine_shared`
//!
//! Replication core used by both client and server.
//!
//! Design goals:
//! - One authoritative simulation, predicted and reconciled on clients.
//! - Closed, versionable sets of packet, action and object types.
//! - Explicit message passing between network tasks and the simulation tick.
//! - No `unsafe`.

pub mod action;
pub mod config;
pub mod framing;
pub mod ids;
pub mod math;
pub mod object;
pub mod packet;
pub mod property;
pub mod render;
pub mod replication;
pub mod scene;
pub mod session;
pub mod state;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::action::*;
    pub use crate::config::*;
    pub use crate::ids::*;
    pub use crate::math::*;
    pub use crate::object::*;
    pub use crate::packet::*;
    pub use crate::session::*;
    pub use crate::state::*;
}
