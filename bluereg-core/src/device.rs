/*!
 * Device Registry
 * Remote peers seen by each adapter, in discovery order
 */

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::bus::{MethodCall, PropertyBag, RemoteObject, Value};
use crate::error::Result;
use crate::mac::MacAddress;

/// A remote peer exposed as `org.bluez.Device1` below an adapter.
#[derive(Debug, Clone)]
pub struct Device {
    adapter: MacAddress,
    address: MacAddress,
    path: String,
    properties: PropertyBag,
    discovered_at: DateTime<Utc>,
    proxy: Arc<dyn RemoteObject>,
}

impl Device {
    /// Build the record from a `Device1` property bag; `None` without an `Address`.
    pub fn from_properties(
        adapter: MacAddress,
        path: impl Into<String>,
        properties: PropertyBag,
        proxy: Arc<dyn RemoteObject>,
    ) -> Option<Self> {
        let address = properties
            .get("Address")
            .and_then(Value::as_str)
            .and_then(MacAddress::parse)?;

        Some(Self {
            adapter,
            address,
            path: path.into(),
            properties,
            discovered_at: Utc::now(),
            proxy,
        })
    }

    /// MAC of the owning adapter.
    pub fn adapter(&self) -> &MacAddress {
        &self.adapter
    }

    pub fn address(&self) -> &MacAddress {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get("Name").and_then(Value::as_str)
    }

    pub fn alias(&self) -> Option<&str> {
        self.properties.get("Alias").and_then(Value::as_str)
    }

    pub fn is_paired(&self) -> bool {
        self.flag("Paired")
    }

    pub fn is_connected(&self) -> bool {
        self.flag("Connected")
    }

    pub fn is_trusted(&self) -> bool {
        self.flag("Trusted")
    }

    pub fn rssi(&self) -> Option<i16> {
        self.properties
            .get("RSSI")
            .and_then(Value::as_i64)
            .and_then(|v| i16::try_from(v).ok())
    }

    fn flag(&self, name: &str) -> bool {
        self.properties
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub async fn property(&self, name: &str) -> Result<Value> {
        Ok(self.proxy.get_property(name).await?)
    }

    pub async fn pair(&self) -> Result<()> {
        Ok(self.proxy.call(MethodCall::Pair).await?)
    }

    pub async fn cancel_pairing(&self) -> Result<()> {
        Ok(self.proxy.call(MethodCall::CancelPairing).await?)
    }

    pub async fn connect(&self) -> Result<()> {
        Ok(self.proxy.call(MethodCall::Connect).await?)
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.proxy.call(MethodCall::Disconnect).await?)
    }

    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        Ok(self.proxy.set_property("Trusted", Value::Bool(trusted)).await?)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.adapter == other.adapter && self.address == other.address
    }
}

impl Eq for Device {}

/// Per-adapter device lists.
///
/// A full scan replaces an adapter's list; signals add or remove single
/// entries. Both must run under [`DeviceRegistry::lock_adapter`] for the
/// same adapter so a rescan never interleaves with a notification.
#[derive(Default)]
pub struct DeviceRegistry {
    lists: RwLock<HashMap<MacAddress, Vec<Device>>>,
    locks: Mutex<HashMap<MacAddress, Arc<Mutex<()>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize mutations for one adapter.
    pub async fn lock_adapter(&self, adapter: &MacAddress) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().await.entry(adapter.clone()).or_default());
        lock.lock_owned().await
    }

    /// Overwrite the adapter's list with a bulk scan result.
    pub async fn replace_all(&self, adapter: &MacAddress, devices: Vec<Device>) {
        self.lists.write().await.insert(adapter.clone(), devices);
    }

    /// Upsert by path: an entry with the same path is replaced in place,
    /// otherwise the device goes to the end. Returns `true` if it was new.
    pub async fn append(&self, adapter: &MacAddress, device: Device) -> bool {
        let mut lists = self.lists.write().await;
        let list = lists.entry(adapter.clone()).or_default();
        match list.iter_mut().find(|known| known.path == device.path) {
            Some(known) => {
                *known = device;
                false
            }
            None => {
                list.push(device);
                true
            }
        }
    }

    /// Remove the first device with `path`; paths are unique per list.
    pub async fn remove_by_path(&self, adapter: &MacAddress, path: &str) -> bool {
        let mut lists = self.lists.write().await;
        let Some(list) = lists.get_mut(adapter) else {
            return false;
        };
        match list.iter().position(|device| device.path == path) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the adapter's list; empty for unknown adapters.
    pub async fn get(&self, adapter: &MacAddress) -> Vec<Device> {
        self.lists
            .read()
            .await
            .get(adapter)
            .cloned()
            .unwrap_or_default()
    }

    /// Make sure the adapter has a (possibly empty) list.
    pub async fn ensure_adapter(&self, adapter: &MacAddress) {
        self.lists.write().await.entry(adapter.clone()).or_default();
    }

    /// Drop the adapter's list. Its mutation lock is kept: a holder and
    /// any later caller of `lock_adapter` must share one mutex.
    pub async fn remove_adapter(&self, adapter: &MacAddress) -> Option<Vec<Device>> {
        self.lists.write().await.remove(adapter)
    }

    /// `true` when no adapter has a list at all. A tracked adapter with
    /// an empty list counts as cached.
    pub async fn is_empty(&self) -> bool {
        self.lists.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.lists.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::device;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const M1: &str = "AA:BB:CC:DD:EE:FF";
    const M2: &str = "11:22:33:44:55:66";

    fn mac(raw: &str) -> MacAddress {
        MacAddress::parse(raw).unwrap()
    }

    fn paths(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(Device::path).collect()
    }

    #[tokio::test]
    async fn replace_all_supersedes_previous_scan() {
        let registry = DeviceRegistry::new();
        let m1 = mac(M1);
        registry
            .replace_all(
                &m1,
                vec![
                    device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a"),
                    device(M1, "/org/bluez/hci0/dev_B", "00:00:00:00:00:0b"),
                ],
            )
            .await;
        registry
            .replace_all(&m1, vec![device(M1, "/org/bluez/hci0/dev_C", "00:00:00:00:00:0c")])
            .await;

        assert_eq!(paths(&registry.get(&m1).await), vec!["/org/bluez/hci0/dev_C"]);
    }

    #[tokio::test]
    async fn append_keeps_discovery_order_and_other_adapters() {
        let registry = DeviceRegistry::new();
        let (m1, m2) = (mac(M1), mac(M2));
        registry
            .append(&m2, device(M2, "/org/bluez/hci1/dev_Z", "00:00:00:00:00:ff"))
            .await;

        assert!(registry.append(&m1, device(M1, "/org/bluez/hci0/dev_B", "00:00:00:00:00:0b")).await);
        assert!(registry.append(&m1, device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")).await);

        assert_eq!(
            paths(&registry.get(&m1).await),
            vec!["/org/bluez/hci0/dev_B", "/org/bluez/hci0/dev_A"]
        );
        assert_eq!(paths(&registry.get(&m2).await), vec!["/org/bluez/hci1/dev_Z"]);
    }

    #[tokio::test]
    async fn append_upserts_by_path() {
        let registry = DeviceRegistry::new();
        let m1 = mac(M1);
        registry
            .replace_all(&m1, vec![device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")])
            .await;

        assert!(!registry.append(&m1, device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")).await);
        assert_eq!(registry.get(&m1).await.len(), 1);
    }

    #[tokio::test]
    async fn remove_by_path_removes_one_entry() {
        let registry = DeviceRegistry::new();
        let (m1, m2) = (mac(M1), mac(M2));
        registry.append(&m1, device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")).await;
        registry.append(&m1, device(M1, "/org/bluez/hci0/dev_B", "00:00:00:00:00:0b")).await;

        assert!(registry.remove_by_path(&m1, "/org/bluez/hci0/dev_A").await);
        assert!(!registry.remove_by_path(&m1, "/org/bluez/hci0/dev_A").await);
        assert!(!registry.remove_by_path(&m2, "/org/bluez/hci0/dev_B").await);
        assert_eq!(paths(&registry.get(&m1).await), vec!["/org/bluez/hci0/dev_B"]);
    }

    #[tokio::test]
    async fn unknown_adapter_yields_empty_list() {
        let registry = DeviceRegistry::new();
        assert!(registry.get(&mac(M1)).await.is_empty());
        assert!(registry.is_empty().await);

        registry.ensure_adapter(&mac(M1)).await;
        assert!(!registry.is_empty().await);
        assert!(registry.get(&mac(M1)).await.is_empty());

        registry.append(&mac(M1), device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")).await;
        assert_eq!(registry.remove_adapter(&mac(M1)).await.map(|l| l.len()), Some(1));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn adapter_lock_outlives_list_removal() {
        let registry = DeviceRegistry::new();
        let m1 = mac(M1);
        registry.ensure_adapter(&m1).await;
        let guard = registry.lock_adapter(&m1).await;

        registry.remove_adapter(&m1).await;
        let second = tokio::time::timeout(Duration::from_millis(20), registry.lock_adapter(&m1)).await;
        assert!(second.is_err(), "a second mutex was handed out while the first is held");

        drop(guard);
        let _guard = registry.lock_adapter(&m1).await;
    }

    #[tokio::test]
    async fn snapshot_does_not_follow_later_mutations() {
        let registry = DeviceRegistry::new();
        let m1 = mac(M1);
        registry.append(&m1, device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")).await;
        let snapshot = registry.get(&m1).await;
        registry.clear().await;
        assert_eq!(snapshot.len(), 1);
        assert!(registry.get(&m1).await.is_empty());
    }

    #[tokio::test]
    async fn adapter_lock_serializes_mutations() {
        let registry = Arc::new(DeviceRegistry::new());
        let m1 = mac(M1);
        let guard = registry.lock_adapter(&m1).await;

        let contender = {
            let registry = Arc::clone(&registry);
            let m1 = m1.clone();
            tokio::spawn(async move {
                let _guard = registry.lock_adapter(&m1).await;
                registry
                    .append(&m1, device(M1, "/org/bluez/hci0/dev_B", "00:00:00:00:00:0b"))
                    .await;
            })
        };

        registry
            .replace_all(&m1, vec![device(M1, "/org/bluez/hci0/dev_A", "00:00:00:00:00:0a")])
            .await;
        tokio::task::yield_now().await;
        assert_eq!(paths(&registry.get(&m1).await), vec!["/org/bluez/hci0/dev_A"]);

        drop(guard);
        contender.await.unwrap();
        assert_eq!(
            paths(&registry.get(&m1).await),
            vec!["/org/bluez/hci0/dev_A", "/org/bluez/hci0/dev_B"]
        );
    }
}
