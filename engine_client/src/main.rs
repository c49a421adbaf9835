//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--host 127.0.0.1] [--port 7777] [--name Player]
//!
//! The client connects to the server, predicts its own movement and
//! reconciles against the snapshots it receives.
//!
//! Console commands:
//!   move <x> <y>   - Set the held movement direction
//!   say <message>  - Send chat message
//!   status         - Show client status
//!   quit           - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use engine_client::{
    input::{InputSource, InputState},
    session::{ClientSession, ConnectionState},
};
use engine_shared::{
    config::EngineConfig,
    session::{GameSession, SessionContext, SessionEvent},
};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().skip(1).collect();
    EngineConfig::from_args(&args)
}

enum Command {
    Continue(Vec<String>),
    Quit,
}

fn exec_console(session: &mut ClientSession, input: &mut InputState, line: &str) -> Command {
    let mut parts = line.split_whitespace();
    let out = match parts.next().unwrap_or_default() {
        "move" => {
            let x = parts.next().and_then(|v| v.parse().ok());
            let y = parts.next().and_then(|v| v.parse().ok());
            match (x, y) {
                (Some(x), Some(y)) => {
                    *input = InputState::new(x, y);
                    vec![format!("Moving towards ({x}, {y})")]
                }
                _ => vec!["Usage: move <x> <y>".to_string()],
            }
        }
        "say" => {
            let message = line
                .trim_start()
                .strip_prefix("say")
                .unwrap_or_default()
                .trim();
            if message.is_empty() {
                vec!["Usage: say <message>".to_string()]
            } else {
                session.send_chat(message);
                Vec::new()
            }
        }
        "status" => {
            let state = session.state();
            let mut out = vec![
                format!("client id: {}", session.client_id()),
                format!("connection: {:?}", session.connection_state()),
                format!(
                    "scene: {} (epoch {}), tick {}",
                    state.scene_key(),
                    state.scene_epoch,
                    state.tick
                ),
                format!("pending actions: {}", session.pending_actions().count()),
            ];
            if let Some(pawn) = state
                .pawn(session.client_id())
                .and_then(|k| state.world().get(k))
            {
                out.push(format!(
                    "pawn: ({:.1}, {:.1})",
                    pawn.state.position.x, pawn.state.position.y
                ));
            }
            out
        }
        "quit" | "exit" => return Command::Quit,
        other => vec![format!("Unknown command: {other}")],
    };
    Command::Continue(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(host = %cfg.host, port = cfg.tcp_port, name = %cfg.player_name, "Starting client");

    let tick_interval = cfg.tick_interval();
    let mut session = ClientSession::new(SessionContext::new(cfg)).context("create session")?;
    session.connect().await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut input = InputState::default();
    let mut next_tick = tokio::time::Instant::now();

    'run: loop {
        while let Ok(line) = console_rx.try_recv() {
            match exec_console(&mut session, &mut input, &line) {
                Command::Continue(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Command::Quit => break 'run,
            }
        }

        session.handle_input(input.poll_actions());
        session.update(tick_interval.as_secs_f32());

        for event in session.drain_events() {
            match event {
                SessionEvent::Chat { sender, message } => println!("{sender}: {message}"),
                SessionEvent::SceneChanged { scene_key, .. } => println!("Scene changed to {scene_key}"),
                SessionEvent::Disconnected { reason } => println!("Disconnected: {reason}"),
                _ => {}
            }
        }

        if session.connection_state() == ConnectionState::Disconnected {
            break;
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    session.stop();
    // Give the writer task a moment to flush our Disconnect.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}
