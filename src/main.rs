//! sheetsync daemon entry point
//!
//! With no command flag the process starts the sync engine and runs until
//! ctrl-c / SIGTERM. The maintenance commands (`--init`, `--test`,
//! `--status`, `--reset-snapshot`) run and exit.

use std::path::PathBuf;
use std::process::ExitCode;

use log::info;

use sheetsync::config::SyncConfig;
use sheetsync::core::snapshot::SnapshotStore;
use sheetsync::Engine;

enum Command {
    Daemon,
    Init,
    Test,
    Status,
    ResetSnapshot(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("./sheetsync.json");
    let mut command = Command::Daemon;

    // Simple argument parsing
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--init" => {
                command = Command::Init;
            }
            "--test" => {
                command = Command::Test;
            }
            "--status" => {
                command = Command::Status;
            }
            "--reset-snapshot" => {
                if i + 1 < args.len() {
                    command = Command::ResetSnapshot(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("--reset-snapshot requires a pair name (sheet_db:sheet_table)");
                    return ExitCode::from(1);
                }
            }
            "--help" | "-h" => {
                println!("sheetsync - bidirectional sheet <-> MySQL sync engine");
                println!();
                println!("Usage: sheetsync [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config PATH        Config file (default: ./sheetsync.json)");
                println!("      --init               Write a default config skeleton and exit");
                println!("      --test               Verify sheet and DB connectivity and exit");
                println!("      --status             Print counters from the running instance");
                println!("      --reset-snapshot P   Clear the snapshot for pair P (full resync)");
                println!("  -h, --help               Show this help");
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("unknown argument '{}', see --help", other);
                return ExitCode::from(1);
            }
        }
        i += 1;
    }

    match command {
        Command::Init => match SyncConfig::write_skeleton(&config_path) {
            Ok(()) => {
                println!("wrote config skeleton to {}", config_path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("init failed: {}", e);
                ExitCode::from(1)
            }
        },
        Command::Test => {
            let config = match SyncConfig::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("config error: {}", e);
                    return ExitCode::from(1);
                }
            };
            let engine = match Engine::new(config) {
                Ok(engine) => engine,
                Err(e) => {
                    eprintln!("startup error: {}", e);
                    return ExitCode::from(1);
                }
            };
            match engine.check().await {
                Ok(()) => {
                    println!("ok: sheet and db connectivity verified");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("check failed: {}", e);
                    ExitCode::from(1)
                }
            }
        }
        Command::Status => {
            let config = match SyncConfig::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("config error: {}", e);
                    return ExitCode::from(2);
                }
            };
            match fetch_status(&config.metrics_addr).await {
                Ok(body) => {
                    print!("{}", body);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("engine not reachable on {}: {}", config.metrics_addr, e);
                    ExitCode::from(2)
                }
            }
        }
        Command::ResetSnapshot(pair) => {
            let config = match SyncConfig::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("config error: {}", e);
                    return ExitCode::from(1);
                }
            };
            if config.find_pair(&pair).is_none() {
                eprintln!("no configured pair named '{}'", pair);
                return ExitCode::from(1);
            }
            let store = match SnapshotStore::new(config.snapshot_dir.clone()) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("cannot open snapshot dir: {}", e);
                    return ExitCode::from(1);
                }
            };
            match store.clear(&pair) {
                Ok(true) => {
                    println!("snapshot cleared for {}; next start performs a full resync", pair);
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("no snapshot existed for {}", pair);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("reset failed: {}", e);
                    ExitCode::from(1)
                }
            }
        }
        Command::Daemon => {
            let config = match SyncConfig::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("config error: {}", e);
                    return ExitCode::from(1);
                }
            };
            info!("starting sheetsync ({} pairs)", config.pairs.len());
            let engine = match Engine::new(config) {
                Ok(engine) => engine,
                Err(e) => {
                    eprintln!("startup error: {}", e);
                    return ExitCode::from(1);
                }
            };
            match engine.run().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("engine stopped with error: {}", e);
                    ExitCode::from(1)
                }
            }
        }
    }
}

/// Scrape the running instance's metrics endpoint. A wildcard bind address
/// is reachable via loopback.
async fn fetch_status(metrics_addr: &str) -> Result<String, String> {
    let addr: std::net::SocketAddr = metrics_addr
        .parse()
        .map_err(|e| format!("bad metrics_addr: {}", e))?;
    let host = if addr.ip().is_unspecified() {
        format!("127.0.0.1:{}", addr.port())
    } else {
        addr.to_string()
    };
    let url = format!("http://{}/metrics", host);
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    response.text().await.map_err(|e| e.to_string())
}
