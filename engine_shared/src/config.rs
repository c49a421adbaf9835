//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files. Every field has a
//! default so partial files are accepted.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Display name the server reports in its accept packet.
    pub server_name: String,
    /// Player name (client only).
    pub player_name: String,
    /// Host the client connects to.
    pub host: String,
    /// Interface the server binds its sockets on.
    pub bind_addr: String,
    /// TCP control port.
    pub tcp_port: u16,
    /// Server UDP port, 0 for ephemeral.
    pub udp_port: u16,
    /// Client local UDP port, 0 for ephemeral.
    pub client_udp_port: u16,
    /// Connection cap enforced at handshake time.
    pub max_players: usize,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Snapshot broadcast rate, independent of `tick_hz`.
    pub snapshot_hz: u32,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Scene opened by authoritative sessions on start.
    pub start_scene: String,
    /// Scene a client shows until the server tells it otherwise.
    pub loading_scene: String,
    pub use_port_forwarding: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: "Server".to_string(),
            player_name: "Player".to_string(),
            host: "127.0.0.1".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            tcp_port: 7777,
            udp_port: 0,
            client_udp_port: 0,
            max_players: 2,
            tick_hz: 60,
            snapshot_hz: 30,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            start_scene: "arena".to_string(),
            loading_scene: "loading".to_string(),
            use_port_forwarding: false,
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Builds a config from command line arguments (program name excluded).
    ///
    /// `--config <path>` is loaded first, so the remaining flags override it
    /// wherever they appear. Unknown arguments are skipped.
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut cfg = match args.iter().position(|a| a == "--config") {
            Some(i) => {
                let path = args
                    .get(i + 1)
                    .context("--config needs a path")?;
                Self::load(path)?
            }
            None => Self::default(),
        };

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let Some(value) = args.get(i + 1) else {
                break;
            };
            match flag {
                "--config" => {}
                "--host" => cfg.host = value.clone(),
                "--bind" => cfg.bind_addr = value.clone(),
                "--port" => cfg.tcp_port = parse_flag(flag, value)?,
                "--udp-port" => {
                    let port = parse_flag(flag, value)?;
                    cfg.udp_port = port;
                    cfg.client_udp_port = port;
                }
                "--name" => {
                    cfg.player_name = value.clone();
                    cfg.server_name = value.clone();
                }
                "--max-players" => cfg.max_players = parse_flag(flag, value)?,
                "--tick-hz" => cfg.tick_hz = parse_flag(flag, value)?,
                "--snapshot-hz" => cfg.snapshot_hz = parse_flag(flag, value)?,
                "--scene" => cfg.start_scene = value.clone(),
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        Ok(cfg)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz.max(1) as f32)
    }

    /// Seconds between two snapshot broadcasts.
    pub fn snapshot_interval_secs(&self) -> f32 {
        1.0 / self.snapshot_hz.max(1) as f32
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn parse_flag<T>(flag: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value {value:?} for {flag}"))
}
