//! `engine_client`
//!
//! Client-side systems:
//! - Connection management (TCP control channel + UDP state channel)
//! - Input sampling into net actions
//! - Prediction and reconciliation against authoritative snapshots

pub mod input;
pub mod net_client;
pub mod session;

pub use net_client::NetClient;
pub use session::ClientSession;
