use async_trait::async_trait;
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::bus::{BusError, InterfaceKind, MethodCall, PropertyBag, RemoteObject, Value};
use crate::device::Device;
use crate::mac::MacAddress;

/// Proxy that answers nothing; registry tests only need identities.
#[derive(Debug)]
pub(crate) struct NullObject {
    path: String,
    kind: InterfaceKind,
}

#[async_trait]
impl RemoteObject for NullObject {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    async fn call(&self, _call: MethodCall) -> Result<(), BusError> {
        Err(BusError::failed("no remote side"))
    }

    async fn get_property(&self, _name: &str) -> Result<Value, BusError> {
        Err(BusError::failed("no remote side"))
    }

    async fn get_all_properties(&self) -> Result<PropertyBag, BusError> {
        Err(BusError::failed("no remote side"))
    }

    async fn set_property(&self, _name: &str, _value: Value) -> Result<(), BusError> {
        Err(BusError::failed("no remote side"))
    }
}

pub(crate) fn null_object(path: &str, kind: InterfaceKind) -> Arc<dyn RemoteObject> {
    Arc::new(NullObject {
        path: path.to_string(),
        kind,
    })
}

pub(crate) fn props(address: &str) -> PropertyBag {
    PropertyBag::from([("Address".to_string(), Value::from(address))])
}

pub(crate) fn adapter(path: &str, address: &str) -> Adapter {
    Adapter::from_properties(path, props(address), null_object(path, InterfaceKind::Adapter))
        .expect("fixture adapter has an address")
}

pub(crate) fn device(adapter: &str, path: &str, address: &str) -> Device {
    let adapter = MacAddress::parse(adapter).expect("fixture adapter MAC");
    Device::from_properties(adapter, path, props(address), null_object(path, InterfaceKind::Device))
        .expect("fixture device has an address")
}
