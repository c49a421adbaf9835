//! Helpers shared by the integration tests.

use std::time::Duration;

use engine_shared::config::EngineConfig;
pub use engine_shared::session::GameSession;

/// Simulated frame length handed to `update`.
pub const FRAME_DT: f32 = 1.0 / 60.0;
/// Upper bound on frames a test waits for something to happen.
pub const MAX_FRAMES: usize = 300;

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Loopback config with ephemeral ports everywhere.
pub fn loopback_config(name: &str) -> EngineConfig {
    EngineConfig {
        server_name: "TestServer".to_string(),
        player_name: name.to_string(),
        host: "127.0.0.1".to_string(),
        bind_addr: "127.0.0.1".to_string(),
        tcp_port: 0,
        udp_port: 0,
        client_udp_port: 0,
        connect_timeout_ms: 2000,
        handshake_timeout_ms: 2000,
        ..Default::default()
    }
}

/// Client config pointing at a server listening on `tcp_port`.
pub fn client_config(name: &str, tcp_port: u16) -> EngineConfig {
    EngineConfig {
        tcp_port,
        ..loopback_config(name)
    }
}

/// Gives the network tasks a moment between frames.
pub async fn pause() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Updates every listed session once per frame until `cond` holds.
/// Evaluates to whether it did within [`MAX_FRAMES`].
#[macro_export]
macro_rules! tick_until {
    ([$($session:expr),+ $(,)?], $cond:expr) => {{
        let mut reached = false;
        for _ in 0..$crate::MAX_FRAMES {
            $( $crate::GameSession::update(&mut $session, $crate::FRAME_DT); )+
            if $cond {
                reached = true;
                break;
            }
            $crate::pause().await;
        }
        reached
    }};
}
