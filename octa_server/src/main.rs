//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p octa_server -- [--addr 127.0.0.1:40000] [--tick-hz 30] [--map base_1]
//!
//! The server activates a scenario, accepts client connections, and
//! replicates the entity set to everyone who asks for the current
//! scenario.
//!
//! Console commands:
//!   map <mapname>  - Switch to a new scenario
//!   save           - Export the entity set to <map>.entities.json
//!   status         - Show server status
//!   quit           - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use octa_server::server::GameServer;
use octa_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(30);
                i += 2;
            }
            "--map" if i + 1 < args.len() => {
                cfg.start_map = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, map = %cfg.start_map, "starting server");

    let mut server = GameServer::bind(cfg.clone()).await.context("bind server")?;
    let local = server.local_addr()?;
    info!(%local, "server listening");

    let start_map = cfg.start_map.clone();
    server.start_scenario(&start_map);

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

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

    println!("Server ready. Type 'map <mapname>' to switch scenarios, 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = std::time::Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        if let Ok(Some(cid)) = server.try_accept(std::time::Duration::from_millis(1)).await {
            info!(client_id = cid.0, "new client accepted");
        }

        server.step().await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
