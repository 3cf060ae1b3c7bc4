/*!
 * Bluetooth Device Management
 * IPC requests served from the BlueZ adapter/device registry
 */

use bluereg_core::{Adapter, Device, DeviceManager, Error, FilterKey, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::ipc::{Request, Response};

pub struct BluetoothManager {
    manager: DeviceManager,
}

impl BluetoothManager {
    pub fn new(manager: DeviceManager) -> Self {
        Self { manager }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }

    /// Drop every signal subscription before the bus connection goes away.
    pub async fn shutdown(&self) {
        self.manager.close().await;
    }

    async fn dispatch(&self, request: Request) -> Result<Response, Error> {
        let response = match request {
            Request::ListAdapters => {
                let default = self.manager.default_adapter().await;
                let adapters = self
                    .manager
                    .adapters()
                    .await
                    .iter()
                    .map(|adapter| AdapterInfo::new(adapter, default.as_ref()))
                    .collect();
                Response::Adapters { adapters }
            }
            Request::GetAdapter { adapter } => {
                let adapter = self.adapter(adapter.as_deref()).await?;
                let default = self.manager.default_adapter().await;
                Response::Adapter {
                    adapter: AdapterInfo::new(&adapter, default.as_ref()),
                }
            }
            Request::SetDefaultAdapter { adapter } => {
                let adapter = self.manager.set_default_adapter(&adapter).await?;
                Response::Adapter {
                    adapter: AdapterInfo::new(&adapter, Some(&adapter)),
                }
            }
            Request::GetDevices { adapter } => {
                devices(self.manager.get_devices(adapter.as_deref()).await)
            }
            Request::ScanDevices { adapter, timeout_ms } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.manager.scan_timeout());
                devices(self.manager.scan_devices(adapter.as_deref(), timeout).await)
            }
            Request::RefreshDevices { adapter } => {
                devices(self.manager.refresh_devices(adapter.as_deref()).await)
            }
            Request::SetScanFilter {
                adapter,
                transport,
                rssi,
                uuids,
                duplicate_data,
            } => {
                let entries = filter_entries(transport, rssi, uuids, duplicate_data);
                self.manager.set_scan_filter(adapter.as_deref(), entries).await?;
                success("Discovery filter applied")
            }
            Request::SetPowered { adapter, powered } => {
                let adapter = self.adapter(adapter.as_deref()).await?;
                adapter.set_powered(powered).await?;
                info!("Adapter {} powered {}", adapter.name(), if powered { "on" } else { "off" });
                success(format!("{} powered {}", adapter.name(), if powered { "on" } else { "off" }))
            }
            Request::Pair { adapter, device } => {
                let device = self.device(adapter.as_deref(), &device).await?;
                info!("Pairing with device: {}", device.address());
                device.pair().await?;
                success(format!("Paired with {}", device.address()))
            }
            Request::Connect { adapter, device } => {
                let device = self.device(adapter.as_deref(), &device).await?;
                info!("Connecting to device: {}", device.address());
                device.connect().await?;
                success(format!("Connected to {}", device.address()))
            }
            Request::Disconnect { adapter, device } => {
                let device = self.device(adapter.as_deref(), &device).await?;
                info!("Disconnecting from device: {}", device.address());
                device.disconnect().await?;
                success(format!("Disconnected from {}", device.address()))
            }
        };
        Ok(response)
    }

    async fn adapter(&self, identifier: Option<&str>) -> Result<Adapter, Error> {
        self.manager.get_adapter(identifier).await.ok_or_else(|| {
            Error::DoesNotExist(match identifier {
                Some(identifier) => format!("No adapter matches {}", identifier),
                None => "No adapter available".to_string(),
            })
        })
    }

    async fn device(&self, adapter: Option<&str>, device: &str) -> Result<Device, Error> {
        self.manager
            .find_device(adapter, device)
            .await
            .ok_or_else(|| Error::DoesNotExist(format!("No device matches {}", device)))
    }
}

fn success(message: impl Into<String>) -> Response {
    Response::Success {
        message: message.into(),
    }
}

fn devices(devices: Vec<Device>) -> Response {
    Response::Devices {
        devices: devices.iter().map(BluetoothDevice::from).collect(),
    }
}

fn filter_entries(
    transport: Option<String>,
    rssi: Option<i16>,
    uuids: Option<Vec<String>>,
    duplicate_data: Option<bool>,
) -> Vec<(FilterKey, Value)> {
    let mut entries = Vec::new();
    if let Some(transport) = transport {
        entries.push((FilterKey::Transport, Value::from(transport)));
    }
    if let Some(rssi) = rssi {
        entries.push((FilterKey::Rssi, Value::from(rssi)));
    }
    if let Some(uuids) = uuids {
        entries.push((FilterKey::Uuids, Value::from(uuids)));
    }
    if let Some(duplicate_data) = duplicate_data {
        entries.push((FilterKey::DuplicateData, Value::from(duplicate_data)));
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub address: String,
    pub name: String,
    pub path: String,
    pub alias: Option<String>,
    pub powered: Option<bool>,
    pub discovering: Option<bool>,
    pub default: bool,
}

impl AdapterInfo {
    fn new(adapter: &Adapter, default: Option<&Adapter>) -> Self {
        Self {
            address: adapter.address().to_string(),
            name: adapter.name().to_string(),
            path: adapter.path().to_string(),
            alias: adapter.alias().map(str::to_string),
            powered: adapter.is_powered(),
            discovering: adapter.is_discovering(),
            default: default.is_some_and(|default| default == adapter),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub path: String,
    pub adapter: String,
    pub paired: bool,
    pub connected: bool,
    pub trusted: bool,
    pub rssi: Option<i16>,
    pub discovered_at: DateTime<Utc>,
}

impl From<&Device> for BluetoothDevice {
    fn from(device: &Device) -> Self {
        Self {
            address: device.address().to_string(),
            name: device.name().map(str::to_string),
            alias: device.alias().map(str::to_string),
            path: device.path().to_string(),
            adapter: device.adapter().to_string(),
            paired: device.is_paired(),
            connected: device.is_connected(),
            trusted: device.is_trusted(),
            rssi: device.rssi(),
            discovered_at: device.discovered_at(),
        }
    }
}
