//! chainsync cluster node daemon.
//!
//! Joins the cluster described by a JSON config file, replays the local
//! chain log, and replicates with configured peers until interrupted.
//!
//! Usage:
//!   chainsync-server --config ./node.json
//!   chainsync-server --port 12020 --log ./chain.log

use std::path::PathBuf;

use tracing::{error, info};

use chainsync_core::ClusterConfig;
use chainsync_net::Replicator;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut port_override: Option<u16> = None;
    let mut log_override: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = Some(args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("invalid port number: {}", args[i + 1]);
                        std::process::exit(1);
                    }));
                    i += 2;
                } else {
                    eprintln!("--port requires a number argument");
                    std::process::exit(1);
                }
            }
            "--log" | "-l" => {
                if i + 1 < args.len() {
                    log_override = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("--log requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("chainsync-server - cluster replication node");
                println!();
                println!("Usage: chainsync-server [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>   JSON cluster config (default: built-in defaults)");
                println!("  -p, --port <PORT>     Listen port override (default: 12020)");
                println!("  -l, --log <PATH>      Chain log path override; enables file sync");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("unknown argument: {}", args[i]);
                std::process::exit(1);
            }
        }
    }

    let mut config = match config_path {
        Some(path) => match ClusterConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ClusterConfig::default(),
    };
    if let Some(port) = port_override {
        config.port = port;
    }
    if let Some(path) = log_override {
        config.sync_file_mode = true;
        config.log_path = path;
    }

    let replicator = match Replicator::start(config).await {
        Ok(replicator) => replicator,
        Err(e) => {
            error!("failed to start replicator: {e}");
            std::process::exit(1);
        }
    };

    info!(
        listen = %replicator.listen_addr(),
        node = %replicator.self_node().server_id,
        "chainsync node running; ctrl-c to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {e}");
    }
    info!("shutting down");
}
