use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use futures_util::{SinkExt, StreamExt};
use tokio::signal;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

use tunnelsup::config::{InMemoryConfigStore, ServerSettings, TunnelConfig};
use tunnelsup::liveness;
use tunnelsup::server;
use tunnelsup::{StatusBroadcaster, Supervisor};

fn cli() -> Command {
    Command::new("tunnelsup")
        .version("0.1.0")
        .author("akagi201")
        .about("Reverse SSH tunnel supervisor with realtime status broadcast")
        .subcommand_required(true)
        .subcommand(
            Command::new("serve")
                .about("Run the supervisor and its realtime status server")
                .arg(
                    Arg::new("settings")
                        .short('s')
                        .long("settings")
                        .value_name("FILE")
                        .help("Server settings file (bind address, liveness interval, log filter)"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("FILE")
                        .help("JSON file of tunnel configs to pre-seed the config store with"),
                ),
        )
        .subcommand(
            Command::new("diagnose")
                .about("Query a running supervisor for one tunnel's diagnostic state")
                .arg(
                    Arg::new("addr")
                        .long("addr")
                        .value_name("WS_URL")
                        .default_value("ws://127.0.0.1:8787/ws")
                        .help("WebSocket URL of a running `serve` instance"),
                )
                .arg(Arg::new("name").required(true).help("Tunnel name to diagnose")),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("serve", sub)) => serve(sub).await,
        Some(("diagnose", sub)) => diagnose(sub).await,
        _ => unreachable!("subcommand_required(true)"),
    }
}

async fn serve(matches: &clap::ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let settings_path = matches.get_one::<String>("settings").map(PathBuf::from);
    let settings = ServerSettings::load(settings_path.as_deref())?;

    tunnelsup::init_logging(&settings.log_filter)?;

    let config_store = if let Some(seed_path) = matches.get_one::<String>("seed") {
        let configs = TunnelConfig::load_file(seed_path)?;
        info!(count = configs.len(), path = %seed_path, "seeded tunnel configs");
        Arc::new(InMemoryConfigStore::seeded(configs))
    } else {
        Arc::new(InMemoryConfigStore::new())
    };

    let broadcaster = Arc::new(StatusBroadcaster::new());
    let supervisor = Supervisor::new(config_store, broadcaster);

    let liveness_targets = tunnelsup::supervisor::SupervisorLivenessTargets { supervisor: supervisor.clone() };
    let liveness_interval = Duration::from_secs(settings.liveness_interval_secs);
    tokio::spawn(liveness::run(liveness_targets, liveness_interval));

    let app = server::router(supervisor);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "tunnel supervisor listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down...");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// One-shot operator tool: connect to a running `serve` instance, send a
/// `diagnose` command, print the first `diagnosticResult` reply, and exit.
async fn diagnose(matches: &clap::ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let addr = matches.get_one::<String>("addr").expect("has default_value");
    let name = matches.get_one::<String>("name").expect("required");

    let (mut socket, _) = tokio_tungstenite::connect_async(addr.as_str()).await?;

    let command = serde_json::json!({ "message": "diagnose", "payload": { "name": name } });
    socket.send(WsMessage::Text(command.to_string())).await?;

    while let Some(frame) = socket.next().await {
        let frame = frame?;
        let WsMessage::Text(text) = frame else { continue };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if value.get("message").and_then(|v| v.as_str()) == Some("diagnosticResult") {
            println!("{}", serde_json::to_string_pretty(&value["payload"])?);
            return Ok(());
        }
        if value.get("message").and_then(|v| v.as_str()) == Some("error") {
            println!("{}", serde_json::to_string_pretty(&value["payload"])?);
            return Ok(());
        }
    }

    Err("connection closed before a diagnosticResult arrived".into())
}
