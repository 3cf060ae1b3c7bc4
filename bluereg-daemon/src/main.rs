/*!
 * BLUEREG Bluetooth Registry Daemon
 * BlueZ adapters and devices over a local socket
 * Onyx Digital Intelligence Development LLC
 */

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{info, warn};

mod bluetooth;
mod config;
mod ipc;

use bluereg_core::{DbusBus, DeviceManager};
use bluetooth::BluetoothManager;
use config::DaemonConfig;
use ipc::{IpcServer, Request, Response};

#[derive(Parser)]
#[command(name = "bluregd")]
#[command(about = "BLUEREG Bluetooth Registry Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/bluereg/bluregd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Check daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("bluereg_daemon={0},bluereg_core={0}", log_level))
        .init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("BLUEREG daemon starting...");

    let (bus, connection) = DbusBus::connect(config.bluetooth.session_bus)?;
    let manager = DeviceManager::new(Arc::new(bus))
        .await
        .with_scan_timeout(Duration::from_millis(config.bluetooth.scan_timeout_ms));

    let adapters = manager.scan_adapters().await;
    info!("Found {} bluetooth adapters", adapters.len());
    if let Some(adapter) = &config.bluetooth.default_adapter {
        if let Err(e) = manager.set_default_adapter(adapter).await {
            warn!("Configured default adapter {} unavailable: {}", adapter, e);
        }
    }
    let bluetooth_manager = Arc::new(BluetoothManager::new(manager));

    // Start IPC server
    let socket_path = Path::new(&config.socket_path);
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    let ipc_server = IpcServer::new(listener, Arc::clone(&bluetooth_manager));

    info!("BLUEREG daemon ready on socket: {}", config.socket_path);

    let outcome = tokio::select! {
        result = ipc_server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    };

    bluetooth_manager.shutdown().await;
    connection.abort();
    if let Err(e) = fs::remove_file(socket_path) {
        warn!("Could not remove socket {}: {}", config.socket_path, e);
    }

    outcome
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    match ipc::request(&config.socket_path, &Request::ListAdapters).await {
        Ok(Response::Adapters { adapters }) => {
            println!("BLUEREG daemon running on {}", config.socket_path);
            for adapter in adapters {
                println!(
                    "{} {} {}{}",
                    adapter.name,
                    adapter.address,
                    adapter.path,
                    if adapter.default { " (default)" } else { "" }
                );
            }
        }
        Ok(Response::Error { message }) => println!("BLUEREG daemon error: {}", message),
        Ok(other) => println!("Unexpected response: {:?}", other),
        Err(e) => println!("BLUEREG daemon not reachable on {}: {}", config.socket_path, e),
    }
    Ok(())
}
