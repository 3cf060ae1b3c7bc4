/*!
 * IPC Server for BLUEREG Daemon
 * JSON lines over Unix socket
 */

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::bluetooth::{AdapterInfo, BluetoothDevice, BluetoothManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    ListAdapters,
    GetAdapter {
        adapter: Option<String>,
    },
    SetDefaultAdapter {
        adapter: String,
    },
    GetDevices {
        adapter: Option<String>,
    },
    ScanDevices {
        adapter: Option<String>,
        timeout_ms: Option<u64>,
    },
    RefreshDevices {
        adapter: Option<String>,
    },
    SetScanFilter {
        adapter: Option<String>,
        transport: Option<String>,
        rssi: Option<i16>,
        uuids: Option<Vec<String>>,
        duplicate_data: Option<bool>,
    },
    SetPowered {
        adapter: Option<String>,
        powered: bool,
    },
    Pair {
        adapter: Option<String>,
        device: String,
    },
    Connect {
        adapter: Option<String>,
        device: String,
    },
    Disconnect {
        adapter: Option<String>,
        device: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Adapters { adapters: Vec<AdapterInfo> },
    Adapter { adapter: AdapterInfo },
    Devices { devices: Vec<BluetoothDevice> },
    Success { message: String },
    Error { message: String },
}

pub struct IpcServer {
    listener: UnixListener,
    bluetooth_manager: Arc<BluetoothManager>,
}

impl IpcServer {
    pub fn new(listener: UnixListener, bluetooth_manager: Arc<BluetoothManager>) -> Self {
        Self {
            listener,
            bluetooth_manager,
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    debug!("New client connected");
                    let bluetooth_manager = Arc::clone(&self.bluetooth_manager);

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, bluetooth_manager).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: UnixStream, bluetooth_manager: Arc<BluetoothManager>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("Received request: {}", line);

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => bluetooth_manager.handle(request).await,
            Err(e) => Response::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    debug!("Client disconnected");
    Ok(())
}

/// Send one request to a running daemon and wait for its reply.
pub async fn request(socket_path: &str, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(anyhow!("daemon closed the connection without replying"));
    }
    Ok(serde_json::from_str(line.trim())?)
}
