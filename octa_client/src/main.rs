//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p octa_client -- [--addr 127.0.0.1:40000]
//!
//! Connects, syncs the entity set, then accepts edit commands on stdin:
//!   status                   - Show replica status
//!   ls                       - List replicated entities
//!   add <class> <x> <y> <z>  - Request entity creation
//!   del <uid>                - Request entity removal
//!   set <uid> <key> <value>  - Request a reliable state change
//!   quit                     - Exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use octa_client::GameClient;
use octa_shared::{config::EngineConfig, entity::EntityUid, math::Vec3};
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
            _ => i += 1,
        }
    }
    cfg
}

fn exec_command(client: &mut GameClient, line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&cmd) = tokens.first() else {
        return Vec::new();
    };
    match cmd {
        "status" => vec![
            format!("client id: {}", client.client_id.0),
            format!("admin: {}", client.admin),
            format!("sync: {:?}", client.session().sync_state()),
            format!("map: {}", client.session().map_name()),
            format!("entities: {}", client.session().world().entity_count()),
        ],
        "ls" => client
            .session()
            .world()
            .entities()
            .map(|e| {
                format!(
                    "  {} {} ({:.1} {:.1} {:.1})",
                    e.uid.0,
                    e.kind.class_name(),
                    e.pos.x,
                    e.pos.y,
                    e.pos.z
                )
            })
            .collect(),
        "add" if tokens.len() >= 5 => {
            let coords: Vec<f32> = tokens[2..5].iter().filter_map(|t| t.parse().ok()).collect();
            if coords.len() != 3 {
                return vec!["Usage: add <class> <x> <y> <z>".to_string()];
            }
            client.session_mut().request_new_entity(
                tokens[1],
                Vec3::new(coords[0], coords[1], coords[2]),
                "{}",
                "",
            );
            vec![format!("requested {}", tokens[1])]
        }
        "del" if tokens.len() >= 2 => match tokens[1].parse::<u32>() {
            Ok(uid) => {
                client.session_mut().request_removal(EntityUid(uid));
                vec![format!("requested removal of {uid}")]
            }
            Err(_) => vec!["Usage: del <uid>".to_string()],
        },
        "set" if tokens.len() >= 4 => match tokens[1].parse::<u32>() {
            Ok(uid) => {
                let value = tokens[3..].join(" ");
                client
                    .session_mut()
                    .request_state_change(EntityUid(uid), tokens[2], &value, true);
                vec![format!("requested {}={value} on {uid}", tokens[2])]
            }
            Err(_) => vec!["Usage: set <uid> <key> <value>".to_string()],
        },
        "quit" | "exit" => std::process::exit(0),
        other => vec![format!("unknown command '{other}'")],
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    info!(peer = %client.server_peer()?, "client running");

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("> ");
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

    println!("Client ready. Type 'status' for info, 'quit' to exit.");

    let tick_interval = std::time::Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut next_tick = tokio::time::Instant::now();
    let start = std::time::Instant::now();

    while client.is_connected() {
        while let Ok(line) = console_rx.try_recv() {
            for out in exec_command(&mut client, &line) {
                println!("{out}");
            }
        }
        client.step(start.elapsed().as_millis() as u64).await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
    info!("connection closed");
    Ok(())
}
