/*!
 * BLUEREG Core
 * Client-side registry of BlueZ adapters and devices, kept consistent
 * with the ObjectManager signals published on the bus
 */

pub mod adapter;
pub mod agent;
pub mod bus;
pub mod connection;
pub mod device;
pub mod error;
pub mod filter;
pub mod introspect;
pub mod mac;
pub mod manager;
pub mod resolver;
pub mod signals;

#[cfg(test)]
pub(crate) mod test_support;

pub use adapter::{Adapter, AdapterRegistry};
pub use agent::{AgentCapability, AgentManager, ProfileManager};
pub use bus::{
    signal_handler, Bus, BusError, HandlerToken, InterfaceKind, MethodCall, Notification,
    PropertyBag, RemoteObject, SignalHandler, SignalKind, Value, BLUEZ_ROOT, BLUEZ_SERVICE,
};
pub use connection::DbusBus;
pub use device::{Device, DeviceRegistry};
pub use error::{Error, Result};
pub use filter::{DiscoveryFilter, FilterKey, Transport};
pub use mac::{normalize_mac, MacAddress};
pub use manager::DeviceManager;
pub use resolver::RescanPolicy;
pub use signals::{Scope, SignalSubscriptions};
