/*!
 * Adapter Registry
 * Known local controllers, indexed by MAC, device name (hciN) and object path
 */

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bus::{MethodCall, PropertyBag, RemoteObject, Value};
use crate::error::Result;
use crate::filter::DiscoveryFilter;
use crate::mac::{normalize_mac, MacAddress};

/// A local Bluetooth controller exposed as `org.bluez.Adapter1`.
#[derive(Debug, Clone)]
pub struct Adapter {
    address: MacAddress,
    name: String,
    path: String,
    properties: PropertyBag,
    proxy: Arc<dyn RemoteObject>,
}

impl Adapter {
    /// Build the record from an `Adapter1` property bag. `None` until
    /// BlueZ publishes a usable `Address`.
    pub fn from_properties(
        path: impl Into<String>,
        properties: PropertyBag,
        proxy: Arc<dyn RemoteObject>,
    ) -> Option<Self> {
        let path = path.into();
        let address = properties
            .get("Address")
            .and_then(Value::as_str)
            .and_then(MacAddress::parse)?;
        let name = path.rsplit('/').next().unwrap_or_default().to_string();

        Some(Self {
            address,
            name,
            path,
            properties,
            proxy,
        })
    }

    pub fn address(&self) -> &MacAddress {
        &self.address
    }

    /// Kernel device name, e.g. `hci0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Property snapshot taken when the record was built.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    pub fn alias(&self) -> Option<&str> {
        self.properties.get("Alias").and_then(Value::as_str)
    }

    pub fn is_powered(&self) -> Option<bool> {
        self.properties.get("Powered").and_then(Value::as_bool)
    }

    pub fn is_discovering(&self) -> Option<bool> {
        self.properties.get("Discovering").and_then(Value::as_bool)
    }

    /// Live read through the proxy.
    pub async fn property(&self, name: &str) -> Result<Value> {
        Ok(self.proxy.get_property(name).await?)
    }

    pub async fn start_discovery(&self) -> Result<()> {
        Ok(self.proxy.call(MethodCall::StartDiscovery).await?)
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        Ok(self.proxy.call(MethodCall::StopDiscovery).await?)
    }

    pub async fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()> {
        let call = MethodCall::SetDiscoveryFilter(filter.to_properties());
        Ok(self.proxy.call(call).await?)
    }

    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        Ok(self.proxy.set_property("Powered", Value::Bool(powered)).await?)
    }

    pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        Ok(self
            .proxy
            .set_property("Discoverable", Value::Bool(discoverable))
            .await?)
    }

    /// Ask BlueZ to drop a device object (and its pairing) from this adapter.
    pub async fn remove_device(&self, device_path: &str) -> Result<()> {
        let call = MethodCall::RemoveDevice(device_path.to_string());
        Ok(self.proxy.call(call).await?)
    }
}

impl PartialEq for Adapter {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.name == other.name && self.path == other.path
    }
}

impl Eq for Adapter {}

/// The three indices move together; every mutation goes through
/// `insert` or `unlink`.
#[derive(Default)]
struct AdapterIndex {
    by_mac: IndexMap<String, Adapter>,
    by_name: HashMap<String, Adapter>,
    by_path: HashMap<String, Adapter>,
}

impl AdapterIndex {
    fn insert(&mut self, adapter: Adapter) -> bool {
        let mac = adapter.address.as_str().to_string();
        if self.by_mac.contains_key(&mac)
            || self.by_name.contains_key(&adapter.name)
            || self.by_path.contains_key(&adapter.path)
        {
            return false;
        }

        self.by_name.insert(adapter.name.clone(), adapter.clone());
        self.by_path.insert(adapter.path.clone(), adapter.clone());
        self.by_mac.insert(mac, adapter);
        true
    }

    // Keys come from the removed record itself, not from the caller.
    fn unlink(&mut self, adapter: &Adapter) {
        self.by_mac.shift_remove(adapter.address.as_str());
        self.by_name.remove(&adapter.name);
        self.by_path.remove(&adapter.path);
    }

    fn clear(&mut self) {
        self.by_mac.clear();
        self.by_name.clear();
        self.by_path.clear();
    }
}

/// Multi-keyed adapter store. Inserts are insert-if-absent: a record
/// colliding with an existing one on any key is rejected whole, so the
/// first writer keeps every key it owns.
#[derive(Default)]
pub struct AdapterRegistry {
    index: RwLock<AdapterIndex>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the adapter was inserted.
    pub async fn add(&self, adapter: Adapter) -> bool {
        self.index.write().await.insert(adapter)
    }

    pub async fn remove_by_path(&self, path: &str) -> Option<Adapter> {
        let mut index = self.index.write().await;
        let adapter = index.by_path.get(path).cloned()?;
        index.unlink(&adapter);
        Some(adapter)
    }

    pub async fn remove_by_mac(&self, mac: &str) -> Option<Adapter> {
        let mut index = self.index.write().await;
        let adapter = index.by_mac.get(&normalize_mac(mac)).cloned()?;
        index.unlink(&adapter);
        Some(adapter)
    }

    pub async fn remove_by_name(&self, name: &str) -> Option<Adapter> {
        let mut index = self.index.write().await;
        let adapter = index.by_name.get(name).cloned()?;
        index.unlink(&adapter);
        Some(adapter)
    }

    pub async fn get_by_mac(&self, mac: &str) -> Option<Adapter> {
        self.index.read().await.by_mac.get(&normalize_mac(mac)).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Adapter> {
        self.index.read().await.by_name.get(name).cloned()
    }

    pub async fn get_by_path(&self, path: &str) -> Option<Adapter> {
        self.index.read().await.by_path.get(path).cloned()
    }

    /// Snapshot in MAC insertion order.
    pub async fn all(&self) -> Vec<Adapter> {
        self.index.read().await.by_mac.values().cloned().collect()
    }

    pub async fn has_any(&self) -> bool {
        !self.index.read().await.by_mac.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_mac.len()
    }

    pub async fn clear(&self) {
        self.index.write().await.clear();
    }

    #[cfg(test)]
    async fn assert_consistent(&self) {
        let index = self.index.read().await;
        assert_eq!(index.by_mac.len(), index.by_name.len());
        assert_eq!(index.by_mac.len(), index.by_path.len());
        for adapter in index.by_mac.values() {
            assert_eq!(index.by_name.get(adapter.name()), Some(adapter));
            assert_eq!(index.by_path.get(adapter.path()), Some(adapter));
        }
    }
}
