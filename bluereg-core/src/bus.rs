/*!
 * Bus Boundary
 * Remote object proxies, introspection and signal delivery as the
 * registry sees them. `connection::DbusBus` is the production side.
 */

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const BLUEZ_ROOT: &str = "/org/bluez";

/// BlueZ interfaces the registry materializes proxies for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Adapter,
    Device,
    AgentManager,
    ProfileManager,
}

impl InterfaceKind {
    pub fn name(self) -> &'static str {
        match self {
            InterfaceKind::Adapter => "org.bluez.Adapter1",
            InterfaceKind::Device => "org.bluez.Device1",
            InterfaceKind::AgentManager => "org.bluez.AgentManager1",
            InterfaceKind::ProfileManager => "org.bluez.ProfileManager1",
        }
    }
}

/// A property value as carried in a variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    StrArray(Vec<String>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::Int16(v) => Some(i64::from(*v)),
            Value::UInt16(v) => Some(i64::from(*v)),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::UInt32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::StrArray(_) => "string array",
            Value::Bytes(_) => "byte array",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StrArray(v)
    }
}

/// Property name -> value, as published by one interface of one object.
pub type PropertyBag = BTreeMap<String, Value>;

/// Remote methods the registry and its callers invoke.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodCall {
    StartDiscovery,
    StopDiscovery,
    SetDiscoveryFilter(PropertyBag),
    RemoveDevice(String),
    Pair,
    CancelPairing,
    Connect,
    Disconnect,
    RegisterAgent { path: String, capability: String },
    RequestDefaultAgent(String),
    UnregisterAgent(String),
    RegisterProfile { path: String, uuid: String, options: PropertyBag },
    UnregisterProfile(String),
}

impl MethodCall {
    pub fn member(&self) -> &'static str {
        match self {
            MethodCall::StartDiscovery => "StartDiscovery",
            MethodCall::StopDiscovery => "StopDiscovery",
            MethodCall::SetDiscoveryFilter(_) => "SetDiscoveryFilter",
            MethodCall::RemoveDevice(_) => "RemoveDevice",
            MethodCall::Pair => "Pair",
            MethodCall::CancelPairing => "CancelPairing",
            MethodCall::Connect => "Connect",
            MethodCall::Disconnect => "Disconnect",
            MethodCall::RegisterAgent { .. } => "RegisterAgent",
            MethodCall::RequestDefaultAgent(_) => "RequestDefaultAgent",
            MethodCall::UnregisterAgent(_) => "UnregisterAgent",
            MethodCall::RegisterProfile { .. } => "RegisterProfile",
            MethodCall::UnregisterProfile(_) => "UnregisterProfile",
        }
    }

    /// Interface the member belongs to.
    pub fn interface(&self) -> InterfaceKind {
        match self {
            MethodCall::StartDiscovery
            | MethodCall::StopDiscovery
            | MethodCall::SetDiscoveryFilter(_)
            | MethodCall::RemoveDevice(_) => InterfaceKind::Adapter,
            MethodCall::Pair
            | MethodCall::CancelPairing
            | MethodCall::Connect
            | MethodCall::Disconnect => InterfaceKind::Device,
            MethodCall::RegisterAgent { .. }
            | MethodCall::RequestDefaultAgent(_)
            | MethodCall::UnregisterAgent(_) => InterfaceKind::AgentManager,
            MethodCall::RegisterProfile { .. } | MethodCall::UnregisterProfile(_) => {
                InterfaceKind::ProfileManager
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    InterfacesAdded,
    InterfacesRemoved,
    PropertiesChanged,
}

/// A signal delivered by the bus connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    InterfacesAdded {
        path: String,
        interfaces: BTreeMap<String, PropertyBag>,
    },
    InterfacesRemoved {
        path: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        path: String,
        interface: String,
        changed: PropertyBag,
        invalidated: Vec<String>,
    },
}

impl Notification {
    pub fn kind(&self) -> SignalKind {
        match self {
            Notification::InterfacesAdded { .. } => SignalKind::InterfacesAdded,
            Notification::InterfacesRemoved { .. } => SignalKind::InterfacesRemoved,
            Notification::PropertiesChanged { .. } => SignalKind::PropertiesChanged,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Notification::InterfacesAdded { path, .. }
            | Notification::InterfacesRemoved { path, .. }
            | Notification::PropertiesChanged { path, .. } => path,
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Async signal callback. The bus delivers one notification at a time
/// per registered handler, in arrival order.
pub type SignalHandler = Arc<dyn Fn(Notification) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`SignalHandler`].
pub fn signal_handler<F, Fut>(f: F) -> SignalHandler
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |notification| Box::pin(f(notification)))
}

/// Identifies one registered signal handler on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(pub u64);

/// Error reported by the bus for a remote call, introspection or match
/// registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .name.as_deref().unwrap_or("org.freedesktop.DBus.Error.Failed"))]
pub struct BusError {
    /// D-Bus error name, e.g. `org.bluez.Error.NotReady`.
    pub name: Option<String>,
    pub message: String,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
        }
    }
}

/// Typed handle to one interface of one remote object.
#[async_trait]
pub trait RemoteObject: Send + Sync + fmt::Debug {
    fn path(&self) -> &str;

    fn kind(&self) -> InterfaceKind;

    async fn call(&self, call: MethodCall) -> Result<(), BusError>;

    async fn get_property(&self, name: &str) -> Result<Value, BusError>;

    async fn get_all_properties(&self) -> Result<PropertyBag, BusError>;

    async fn set_property(&self, name: &str, value: Value) -> Result<(), BusError>;
}

/// The bus connection as consumed by the registry. The connection is
/// owned outside the registry and outlives it.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Proxy for `path`, or `None` when no proxy can be built for it.
    fn remote_object(&self, path: &str, kind: InterfaceKind) -> Option<Arc<dyn RemoteObject>>;

    /// Raw introspection XML for `path`.
    async fn introspect(&self, path: &str) -> Result<String, BusError>;

    async fn add_signal_handler(
        &self,
        kind: SignalKind,
        handler: SignalHandler,
    ) -> Result<HandlerToken, BusError>;

    async fn remove_signal_handler(&self, token: HandlerToken) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_calls_map_to_their_interface() {
        assert_eq!(MethodCall::StartDiscovery.interface(), InterfaceKind::Adapter);
        assert_eq!(MethodCall::Pair.interface(), InterfaceKind::Device);
        assert_eq!(
            MethodCall::UnregisterAgent("/agent".into()).interface().name(),
            "org.bluez.AgentManager1"
        );
        assert_eq!(MethodCall::RemoveDevice("/x".into()).member(), "RemoveDevice");
    }

    #[test]
    fn integer_values_widen() {
        assert_eq!(Value::Int16(-60).as_i64(), Some(-60));
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(Value::Str("x".into()).as_i64(), None);
        assert_eq!(Value::ObjectPath("/org/bluez".into()).as_str(), Some("/org/bluez"));
    }

    #[test]
    fn bus_error_display_falls_back_to_generic_name() {
        let err = BusError::failed("boom");
        assert_eq!(err.to_string(), "org.freedesktop.DBus.Error.Failed: boom");

        let err = BusError::new("org.bluez.Error.NotReady", "Resource Not Ready");
        assert_eq!(err.to_string(), "org.bluez.Error.NotReady: Resource Not Ready");
    }
}
