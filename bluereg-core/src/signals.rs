/*!
 * Signal Subscription Manager
 * InterfacesAdded/InterfacesRemoved handler pairs per scope, and the
 * routing of those notifications into the registries
 */

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::adapter::Adapter;
use crate::bus::{
    signal_handler, Bus, HandlerToken, InterfaceKind, Notification, PropertyBag, SignalHandler,
    SignalKind, Value,
};
use crate::device::Device;
use crate::error::Result;
use crate::mac::MacAddress;
use crate::manager::Shared;

/// What a handler pair watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Adapters appearing and disappearing below `/org/bluez`.
    Adapters,
    /// Devices below one adapter, keyed by the adapter's MAC.
    Devices(MacAddress),
}

#[derive(Debug, Clone, Copy)]
struct HandlerPair {
    added: HandlerToken,
    removed: HandlerToken,
}

#[derive(Default)]
struct State {
    active: HashMap<Scope, HandlerPair>,
    closed: bool,
}

/// Registered handler pairs, at most one per scope.
#[derive(Default)]
pub struct SignalSubscriptions {
    state: Mutex<State>,
}

impl SignalSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register both handlers for `scope`. Returns `Ok(false)` without
    /// touching the bus if the scope is already subscribed or the
    /// subscriptions were torn down.
    pub async fn subscribe(
        &self,
        bus: &dyn Bus,
        scope: Scope,
        added: SignalHandler,
        removed: SignalHandler,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.closed || state.active.contains_key(&scope) {
            return Ok(false);
        }

        let added = bus.add_signal_handler(SignalKind::InterfacesAdded, added).await?;
        let removed = match bus
            .add_signal_handler(SignalKind::InterfacesRemoved, removed)
            .await
        {
            Ok(token) => token,
            Err(err) => {
                if let Err(rollback) = bus.remove_signal_handler(added).await {
                    warn!("Could not roll back signal handler for {:?}: {}", scope, rollback);
                }
                return Err(err.into());
            }
        };

        debug!("Registered signal handlers for {:?}", scope);
        state.active.insert(scope, HandlerPair { added, removed });
        Ok(true)
    }

    /// Drop one scope's handlers. `Ok(false)` if it was not subscribed.
    pub async fn unsubscribe(&self, bus: &dyn Bus, scope: &Scope) -> Result<bool> {
        let Some(pair) = self.state.lock().await.active.remove(scope) else {
            return Ok(false);
        };

        let added = bus.remove_signal_handler(pair.added).await;
        let removed = bus.remove_signal_handler(pair.removed).await;
        added?;
        removed?;
        Ok(true)
    }

    /// Teardown: unregister every scope, device scopes first, and refuse
    /// further subscriptions. Each failure is logged and the remaining
    /// handlers are still attempted. Returns the number of failures.
    pub async fn unsubscribe_all(&self, bus: &dyn Bus) -> usize {
        let mut drained: Vec<(Scope, HandlerPair)> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.active.drain().collect()
        };
        drained.sort_by_key(|(scope, _)| *scope == Scope::Adapters);

        let mut failures = 0;
        for (scope, pair) in drained {
            for token in [pair.added, pair.removed] {
                if let Err(err) = bus.remove_signal_handler(token).await {
                    error!("Unable to remove signal handler for {:?}: {}", scope, err);
                    failures += 1;
                }
            }
        }
        failures
    }

    pub async fn is_subscribed(&self, scope: &Scope) -> bool {
        self.state.lock().await.active.contains_key(scope)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

fn has_address(properties: &PropertyBag) -> bool {
    properties.get("Address").and_then(Value::as_str).is_some()
}

fn names_interface(interfaces: &[String], kind: InterfaceKind) -> bool {
    interfaces.iter().any(|name| name == kind.name())
}

fn is_child_of(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

impl Shared {
    /// Handler that forwards to the registries while they are alive.
    fn route<F, Fut>(self: &Arc<Self>, f: F) -> SignalHandler
    where
        F: Fn(Arc<Shared>, Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::downgrade(self);
        signal_handler(move |notification| {
            let pending = shared.upgrade().map(|shared| f(shared, notification));
            async move {
                if let Some(pending) = pending {
                    pending.await;
                }
            }
        })
    }

    pub(crate) async fn watch_adapters(self: &Arc<Self>) -> Result<bool> {
        let added = self.route(|shared, n| async move { shared.on_adapter_added(n).await });
        let removed = self.route(|shared, n| async move { shared.on_adapter_removed(n).await });
        self.signals
            .subscribe(self.bus.as_ref(), Scope::Adapters, added, removed)
            .await
    }

    pub(crate) async fn watch_devices(self: &Arc<Self>, adapter: &Adapter) -> Result<bool> {
        let prefix = format!("{}/", adapter.path());

        let added = {
            let (mac, prefix) = (adapter.address().clone(), prefix.clone());
            self.route(move |shared, n| {
                let (mac, prefix) = (mac.clone(), prefix.clone());
                async move { shared.on_device_added(&mac, &prefix, n).await }
            })
        };
        let removed = {
            let mac = adapter.address().clone();
            self.route(move |shared, n| {
                let (mac, prefix) = (mac.clone(), prefix.clone());
                async move { shared.on_device_removed(&mac, &prefix, n).await }
            })
        };

        let scope = Scope::Devices(adapter.address().clone());
        self.signals
            .subscribe(self.bus.as_ref(), scope, added, removed)
            .await
    }

    /// Give a registered adapter its device list and device-level handlers.
    /// Adapters the registry rejected are left alone.
    pub(crate) async fn track_adapter(self: &Arc<Self>, adapter: &Adapter) {
        {
            let _guard = self.devices.lock_adapter(adapter.address()).await;
            if !self.is_registered(adapter).await {
                return;
            }
            self.devices.ensure_adapter(adapter.address()).await;
        }

        if let Err(err) = self.watch_devices(adapter).await {
            error!(
                "Could not register device signal handlers for adapter {}: {}",
                adapter.address(),
                err
            );
        }
    }

    /// Undo everything `track_adapter` set up, and the default if it
    /// pointed at this adapter.
    pub(crate) async fn forget_adapter(&self, adapter: &Adapter) {
        {
            let _guard = self.devices.lock_adapter(adapter.address()).await;
            self.devices.remove_adapter(adapter.address()).await;
        }

        let scope = Scope::Devices(adapter.address().clone());
        if let Err(err) = self.signals.unsubscribe(self.bus.as_ref(), &scope).await {
            error!("Unable to remove signal handlers for {:?}: {}", scope, err);
        }

        let mut default = self.default_adapter.write().await;
        if default.as_ref() == Some(adapter.address()) {
            debug!("Default adapter {} went away", adapter.address());
            *default = None;
        }
    }

    async fn on_adapter_added(self: &Arc<Self>, notification: Notification) {
        let Notification::InterfacesAdded { path, interfaces } = notification else {
            return;
        };
        let Some(properties) = interfaces.get(InterfaceKind::Adapter.name()) else {
            return;
        };
        if !has_address(properties) {
            debug!("Adapter {} announced without an address yet, ignoring", path);
            return;
        }

        let Some(proxy) = self.bus.remote_object(&path, InterfaceKind::Adapter) else {
            warn!("Cannot create Adapter1 object for added adapter {}", path);
            return;
        };
        let Some(adapter) = Adapter::from_properties(path.as_str(), properties.clone(), proxy) else {
            warn!("Adapter {} announced with an unusable address", path);
            return;
        };

        debug!("New bluetooth adapter: {}, MAC: {}", path, adapter.address());
        if self.adapters.add(adapter.clone()).await {
            debug!("Bluetooth adapter {} added to adapter list", adapter.address());
        }
        self.track_adapter(&adapter).await;
    }

    async fn on_adapter_removed(&self, notification: Notification) {
        let Notification::InterfacesRemoved { path, interfaces } = notification else {
            return;
        };
        if !names_interface(&interfaces, InterfaceKind::Adapter) {
            return;
        }

        match self.adapters.remove_by_path(&path).await {
            Some(adapter) => {
                self.forget_adapter(&adapter).await;
                debug!("Bluetooth adapter {} removed from internal list", path);
            }
            None => debug!("Bluetooth adapter {} was not known", path),
        }
    }

    async fn on_device_added(&self, adapter: &MacAddress, prefix: &str, notification: Notification) {
        let Notification::InterfacesAdded { path, interfaces } = notification else {
            return;
        };
        if !is_child_of(&path, prefix) {
            return;
        }
        let Some(properties) = interfaces.get(InterfaceKind::Device.name()) else {
            return;
        };
        if !has_address(properties) {
            debug!("Device {} announced without an address yet, ignoring", path);
            return;
        }
        let Some(proxy) = self.bus.remote_object(&path, InterfaceKind::Device) else {
            warn!("Cannot create Device1 object for added device {}", path);
            return;
        };
        let Some(device) =
            Device::from_properties(adapter.clone(), path.as_str(), properties.clone(), proxy)
        else {
            warn!("Device {} announced with an unusable address", path);
            return;
        };

        let _guard = self.devices.lock_adapter(adapter).await;
        let registered = self
            .adapters
            .get_by_mac(adapter.as_str())
            .await
            .is_some_and(|known| prefix.strip_suffix('/') == Some(known.path()));
        if !registered {
            debug!("Device {} announced for an adapter that is gone", path);
            return;
        }
        if self.devices.append(adapter, device).await {
            debug!("New bluetooth device {} added for adapter {}", path, adapter);
        } else {
            debug!("Bluetooth device {} refreshed for adapter {}", path, adapter);
        }
    }

    async fn on_device_removed(&self, adapter: &MacAddress, prefix: &str, notification: Notification) {
        let Notification::InterfacesRemoved { path, interfaces } = notification else {
            return;
        };
        if !is_child_of(&path, prefix) || !names_interface(&interfaces, InterfaceKind::Device) {
            return;
        }

        let _guard = self.devices.lock_adapter(adapter).await;
        if self.devices.remove_by_path(adapter, &path).await {
            debug!("Bluetooth device {} removed from internal list", path);
        } else {
            debug!("Bluetooth device {} was not tracked", path);
        }
    }
}
