//! `engine_server`
//!
//! Authority side of the replication layer:
//! - `NetServer`: TCP control connections plus one UDP gameplay socket
//! - `HostSession`: authoritative simulation and snapshot broadcast
//! - `SessionManager`: switches between singleplayer, client and host
//!
//! Networking model:
//! - TCP: handshake, chat, scene changes, disconnects
//! - UDP: actions (client to server) and snapshots (server to client)

pub mod host;
pub mod manager;
pub mod nat;
pub mod net_server;

pub use host::HostSession;
pub use manager::SessionManager;
pub use net_server::{NetServer, ServerEvent};
