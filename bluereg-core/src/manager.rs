/*!
 * Device Manager
 * Owns the adapter and device registries for one bus connection and keeps
 * them in step with bulk scans and ObjectManager signals
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapter::{Adapter, AdapterRegistry};
use crate::agent::{AgentManager, ProfileManager};
use crate::bus::{Bus, HandlerToken, InterfaceKind, SignalHandler, SignalKind, Value, BLUEZ_ROOT};
use crate::device::{Device, DeviceRegistry};
use crate::error::{Error, Result};
use crate::filter::{DiscoveryFilter, FilterKey};
use crate::introspect::find_child_nodes;
use crate::mac::{normalize_mac, MacAddress};
use crate::resolver::RescanPolicy;
use crate::signals::{Scope, SignalSubscriptions};

/// State reachable from signal handlers. Handlers hold it weakly so that
/// dropping the manager stops routing.
pub(crate) struct Shared {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) devices: DeviceRegistry,
    pub(crate) signals: SignalSubscriptions,
    pub(crate) default_adapter: RwLock<Option<MacAddress>>,
}

impl Shared {
    async fn materialize_adapter(&self, path: &str) -> Option<Adapter> {
        let proxy = self.bus.remote_object(path, InterfaceKind::Adapter)?;
        let properties = match proxy.get_all_properties().await {
            Ok(properties) => properties,
            Err(err) => {
                warn!("Skipping {}: cannot read Adapter1 properties: {}", path, err);
                return None;
            }
        };

        let adapter = Adapter::from_properties(path, properties, proxy);
        if adapter.is_none() {
            debug!("Skipping {}: no usable Address", path);
        }
        adapter
    }

    async fn materialize_device(&self, adapter: &Adapter, path: &str) -> Option<Device> {
        let proxy = self.bus.remote_object(path, InterfaceKind::Device)?;
        let properties = match proxy.get_all_properties().await {
            Ok(properties) => properties,
            Err(err) => {
                warn!("Skipping {}: cannot read Device1 properties: {}", path, err);
                return None;
            }
        };

        let device = Device::from_properties(adapter.address().clone(), path, properties, proxy);
        if device.is_none() {
            debug!("Skipping {}: no usable Address", path);
        }
        device
    }

    /// `true` while the registry still holds this exact adapter record.
    pub(crate) async fn is_registered(&self, adapter: &Adapter) -> bool {
        self.adapters
            .get_by_path(adapter.path())
            .await
            .is_some_and(|known| known == *adapter)
    }

    /// Rebuild the adapter's device list from introspection, under the
    /// adapter's mutation lock. The result is dropped if the adapter was
    /// removed while the scan ran.
    pub(crate) async fn rescan_devices(&self, adapter: &Adapter) -> Vec<Device> {
        let _guard = self.devices.lock_adapter(adapter.address()).await;

        let mut found = Vec::new();
        for node in find_child_nodes(self.bus.as_ref(), adapter.path()).await {
            let path = format!("{}/{}", adapter.path(), node);
            if let Some(device) = self.materialize_device(adapter, &path).await {
                found.push(device);
            }
        }

        if !self.is_registered(adapter).await {
            debug!(
                "Adapter {} went away during rescan, discarding {} devices",
                adapter.name(),
                found.len()
            );
            return Vec::new();
        }

        debug!("Found {} devices on {}", found.len(), adapter.name());
        self.devices.replace_all(adapter.address(), found.clone()).await;
        found
    }
}

/// Entry point of the registry.
///
/// One manager per bus connection. Construction subscribes to adapter
/// add/remove signals; [`DeviceManager::close`] tears every subscription
/// down and empties the registries.
pub struct DeviceManager {
    pub(crate) shared: Arc<Shared>,
    scan_timeout: Duration,
}

impl DeviceManager {
    /// Discovery window used when `get_devices` has to scan.
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(5000);

    pub async fn new(bus: Arc<dyn Bus>) -> Self {
        let shared = Arc::new(Shared {
            bus,
            adapters: AdapterRegistry::new(),
            devices: DeviceRegistry::new(),
            signals: SignalSubscriptions::new(),
            default_adapter: RwLock::new(None),
        });

        if let Err(err) = shared.watch_adapters().await {
            error!("Unable to register adapter signal handlers: {}", err);
        }

        Self {
            shared,
            scan_timeout: Self::DEFAULT_SCAN_TIMEOUT,
        }
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.shared.bus
    }

    /// Introspect `/org/bluez` and register every adapter found.
    ///
    /// Adapters already known keep their record; device lists are left
    /// untouched. The first adapter becomes the default when none is set.
    pub async fn scan_adapters(&self) -> Vec<Adapter> {
        let shared = &self.shared;
        if let Err(err) = shared.watch_adapters().await {
            error!("Unable to register adapter signal handlers: {}", err);
        }

        let mut found = Vec::new();
        for node in find_child_nodes(shared.bus.as_ref(), BLUEZ_ROOT).await {
            let path = format!("{}/{}", BLUEZ_ROOT, node);
            let Some(adapter) = shared.materialize_adapter(&path).await else {
                continue;
            };

            if shared.adapters.add(adapter.clone()).await {
                info!("Found bluetooth adapter {} ({})", adapter.name(), adapter.address());
            }
            shared.track_adapter(&adapter).await;
            found.push(adapter);
        }

        let mut default = shared.default_adapter.write().await;
        if default.is_none() {
            if let Some(first) = shared.adapters.all().await.into_iter().next() {
                debug!("Default adapter is now {}", first.address());
                *default = Some(first.address().clone());
            }
        }

        found
    }

    /// Every registered adapter, scanning first when none is known.
    pub async fn adapters(&self) -> Vec<Adapter> {
        if !self.shared.adapters.has_any().await {
            self.scan_adapters().await;
        }
        self.shared.adapters.all().await
    }

    pub async fn default_adapter(&self) -> Option<Adapter> {
        let default = self.shared.default_adapter.read().await.clone()?;
        self.shared.adapters.get_by_mac(default.as_str()).await
    }

    /// Make the adapter named by MAC, `hciN` name or object path the default.
    pub async fn set_default_adapter(&self, identifier: &str) -> Result<Adapter> {
        let adapter = self
            .resolve(Some(identifier), RescanPolicy::OnMiss)
            .await
            .ok_or_else(|| Error::DoesNotExist(format!("No adapter matches {identifier}")))?;

        info!("Default adapter set to {} ({})", adapter.name(), adapter.address());
        *self.shared.default_adapter.write().await = Some(adapter.address().clone());
        Ok(adapter)
    }

    /// Run discovery for `timeout` on the resolved adapter, then rebuild
    /// its device list. If discovery cannot start, the cached list is
    /// returned unchanged.
    pub async fn scan_devices(&self, adapter: Option<&str>, timeout: Duration) -> Vec<Device> {
        let Some(adapter) = self.get_adapter(adapter).await else {
            debug!("No adapter to scan on");
            return Vec::new();
        };
        self.discover_on(&adapter, timeout).await
    }

    /// Rebuild the device list from introspection without running discovery.
    pub async fn refresh_devices(&self, adapter: Option<&str>) -> Vec<Device> {
        match self.get_adapter(adapter).await {
            Some(adapter) => self.shared.rescan_devices(&adapter).await,
            None => Vec::new(),
        }
    }

    /// Cached devices of the resolved adapter. Only when no adapter has a
    /// device list at all does a scan with the configured timeout run first;
    /// a tracked adapter whose list emptied out is served as is.
    pub async fn get_devices(&self, adapter: Option<&str>) -> Vec<Device> {
        let Some(adapter) = self.get_adapter(adapter).await else {
            return Vec::new();
        };

        if self.shared.devices.is_empty().await {
            debug!("No device lists cached, scanning on {}", adapter.name());
            return self.discover_on(&adapter, self.scan_timeout).await;
        }
        self.shared.devices.get(adapter.address()).await
    }

    /// A cached device of the resolved adapter, by MAC or object path.
    pub async fn find_device(&self, adapter: Option<&str>, device: &str) -> Option<Device> {
        let mac = normalize_mac(device);
        self.get_devices(adapter)
            .await
            .into_iter()
            .find(|known| known.address().as_str() == mac || known.path() == device)
    }

    /// Validate every entry, then apply the filter to the resolved
    /// adapter. Nothing is sent if any entry is rejected.
    pub async fn set_scan_filter<I>(&self, adapter: Option<&str>, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (FilterKey, Value)>,
    {
        let filter = DiscoveryFilter::from_entries(entries)?;
        let adapter = self
            .get_adapter(adapter)
            .await
            .ok_or_else(|| Error::DoesNotExist("No adapter available".to_string()))?;
        adapter.set_discovery_filter(&filter).await
    }

    pub fn agent_manager(&self) -> Option<AgentManager> {
        AgentManager::new(self.shared.bus.as_ref())
    }

    pub fn profile_manager(&self) -> Option<ProfileManager> {
        ProfileManager::new(self.shared.bus.as_ref())
    }

    /// Register an additional handler directly on the bus. The caller
    /// owns the token and must unregister it.
    pub async fn register_signal_handler(
        &self,
        kind: SignalKind,
        handler: SignalHandler,
    ) -> Result<HandlerToken> {
        Ok(self.shared.bus.add_signal_handler(kind, handler).await?)
    }

    pub async fn unregister_signal_handler(&self, token: HandlerToken) -> Result<()> {
        Ok(self.shared.bus.remove_signal_handler(token).await?)
    }

    pub async fn is_subscribed(&self, scope: &Scope) -> bool {
        self.shared.signals.is_subscribed(scope).await
    }

    /// Unregister every handler, best effort, and drop all cached state.
    /// Signal routing does not resume afterwards.
    pub async fn close(&self) {
        let shared = &self.shared;
        let failures = shared.signals.unsubscribe_all(shared.bus.as_ref()).await;
        if failures > 0 {
            warn!("{} signal handlers could not be removed", failures);
        }

        shared.devices.clear().await;
        shared.adapters.clear().await;
        *shared.default_adapter.write().await = None;
        info!("Device manager closed");
    }

    async fn discover_on(&self, adapter: &Adapter, timeout: Duration) -> Vec<Device> {
        if let Err(err) = adapter.start_discovery().await {
            warn!("Could not start discovery on {}: {}", adapter.name(), err);
            return self.shared.devices.get(adapter.address()).await;
        }

        debug!("Discovering on {} for {:?}", adapter.name(), timeout);
        tokio::time::sleep(timeout).await;

        if let Err(err) = adapter.stop_discovery().await {
            warn!("Could not stop discovery on {}: {}", adapter.name(), err);
        }
        self.shared.rescan_devices(adapter).await
    }
}
