//! Dedicated server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--bind 0.0.0.0] [--port 7777] [--max-players 8] [--scene arena]
//!
//! The server hosts an authoritative session without a local player, applies
//! client actions every tick and broadcasts snapshots at the snapshot rate.
//!
//! Console commands:
//!   scene <key>          - Switch every client to another scene
//!   status               - Show server status
//!   kick <id> [reason]   - Disconnect a client
//!   say <message>        - Send chat as the server
//!   quit                 - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use engine_server::host::HostSession;
use engine_shared::{
    config::EngineConfig,
    ids::ClientId,
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

fn exec_console(host: &mut HostSession, line: &str) -> Command {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&head) = tokens.first() else {
        return Command::Continue(Vec::new());
    };

    let out = match head {
        "scene" => match tokens.get(1) {
            Some(key) => match host.switch_scene(key) {
                Ok(()) => vec![format!("Scene '{key}' loaded")],
                Err(e) => vec![format!("Failed to load scene: {e:#}")],
            },
            None => vec!["Usage: scene <key>".to_string()],
        },
        "status" => {
            let state = host.state();
            let mut out = vec![
                format!(
                    "Scene: {} (epoch {}), tick {}",
                    state.scene_key(),
                    state.scene_epoch,
                    state.tick
                ),
                format!(
                    "Ports: tcp {} udp {}",
                    host.server().tcp_port(),
                    host.server().udp_port()
                ),
                format!("Objects: {}", state.world().len()),
                format!("Clients: {}", host.server().client_count()),
            ];
            for client in host.clients() {
                out.push(format!(
                    "  {}: {} udp={} last_seq={}",
                    client.client_id,
                    client.name,
                    client.udp_addr,
                    host.last_processed(client.client_id).unwrap_or(0)
                ));
            }
            out
        }
        "kick" => match tokens.get(1).and_then(|v| v.parse::<i32>().ok()) {
            Some(id) => {
                let reason = (tokens.len() > 2).then(|| tokens[2..].join(" "));
                if host.kick(ClientId(id), reason.as_deref()) {
                    vec![format!("Kicked client {id}")]
                } else {
                    vec![format!("No client with id {id}")]
                }
            }
            None => vec!["Usage: kick <id> [reason]".to_string()],
        },
        "say" if tokens.len() > 1 => {
            host.say(&tokens[1..].join(" "));
            Vec::new()
        }
        "say" => vec!["Usage: say <message>".to_string()],
        "quit" | "exit" => return Command::Quit,
        other => vec![format!("Unknown command: {other}")],
    };
    Command::Continue(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        bind = %cfg.bind_addr,
        port = cfg.tcp_port,
        tick_hz = cfg.tick_hz,
        snapshot_hz = cfg.snapshot_hz,
        scene = %cfg.start_scene,
        "Starting server"
    );

    let tick_interval = cfg.tick_interval();
    let mut host = HostSession::start(SessionContext::new(cfg), false)
        .await
        .context("start host session")?;

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

    println!("Server ready. Type 'scene <key>' to change scene, 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let mut next_tick = tokio::time::Instant::now();

    'run: loop {
        while let Ok(line) = console_rx.try_recv() {
            match exec_console(&mut host, &line) {
                Command::Continue(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Command::Quit => break 'run,
            }
        }

        host.update(tick_interval.as_secs_f32());

        for event in host.drain_events() {
            match event {
                SessionEvent::ClientJoined { client_id, name } => {
                    println!("{name} joined as client {client_id}")
                }
                SessionEvent::ClientLeft { client_id } => println!("Client {client_id} left"),
                SessionEvent::Chat { sender, message } => println!("{sender}: {message}"),
                _ => {}
            }
        }

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    info!("Server shutting down");
    host.stop();
    // Give the connection writers a moment to flush the shutdown notice.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}
