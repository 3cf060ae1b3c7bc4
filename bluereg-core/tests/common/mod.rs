//! In-memory BlueZ object tree standing in for the system bus.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use bluereg_core::{
    Bus, BusError, HandlerToken, InterfaceKind, MethodCall, Notification, PropertyBag,
    RemoteObject, SignalHandler, SignalKind, Value,
};

pub const ADAPTER_PATH: &str = "/org/bluez/hci0";
pub const ADAPTER_MAC: &str = "AA:BB:CC:DD:EE:FF";
pub const DEVICE_PATH: &str = "/org/bluez/hci0/dev_11_22_33_44_55_66";
pub const DEVICE_MAC: &str = "11:22:33:44:55:66";

#[derive(Default)]
struct State {
    objects: BTreeMap<String, BTreeMap<String, PropertyBag>>,
    handlers: BTreeMap<u64, (SignalKind, SignalHandler)>,
    next_token: u64,
    introspections: Vec<String>,
    registrations: usize,
    removal_attempts: usize,
    failing_removals: usize,
    failing_introspections: HashSet<String>,
    held_introspections: HashMap<String, Arc<Gate>>,
    refuse_discovery: bool,
    calls: Vec<(String, MethodCall)>,
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

/// Holds the next introspection of one path open until released.
pub struct IntrospectionGate(Arc<Gate>);

impl IntrospectionGate {
    /// Wait until the held introspection has started.
    pub async fn entered(&self) {
        self.0.entered.notified().await;
    }

    pub fn release(&self) {
        self.0.release.notify_one();
    }
}

#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<State>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_adapter(&self, path: &str, address: &str) {
        let props = PropertyBag::from([
            ("Address".to_string(), Value::from(address)),
            ("Powered".to_string(), Value::Bool(true)),
            ("Discovering".to_string(), Value::Bool(false)),
        ]);
        self.add_interface(path, InterfaceKind::Adapter, props);
    }

    pub fn add_device(&self, path: &str, address: &str) {
        let props = PropertyBag::from([
            ("Address".to_string(), Value::from(address)),
            ("Paired".to_string(), Value::Bool(false)),
            ("RSSI".to_string(), Value::Int16(-52)),
        ]);
        self.add_interface(path, InterfaceKind::Device, props);
    }

    pub fn add_interface(&self, path: &str, kind: InterfaceKind, props: PropertyBag) {
        self.state
            .lock()
            .unwrap()
            .objects
            .entry(path.to_string())
            .or_default()
            .insert(kind.name().to_string(), props);
    }

    /// Bare node with no BlueZ interface, e.g. a half-initialized object.
    pub fn add_node(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .entry(path.to_string())
            .or_default();
    }

    pub fn remove_object(&self, path: &str) {
        self.state.lock().unwrap().objects.remove(path);
    }

    pub fn fail_introspection(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_introspections
            .insert(path.to_string());
    }

    /// The reply is computed when the call arrives, then delivered only
    /// after the gate is released.
    pub fn hold_introspection(&self, path: &str) -> IntrospectionGate {
        let gate = Arc::new(Gate::default());
        self.state
            .lock()
            .unwrap()
            .held_introspections
            .insert(path.to_string(), Arc::clone(&gate));
        IntrospectionGate(gate)
    }

    pub fn fail_next_removals(&self, count: usize) {
        self.state.lock().unwrap().failing_removals = count;
    }

    pub fn refuse_discovery(&self) {
        self.state.lock().unwrap().refuse_discovery = true;
    }

    pub fn handler_count(&self) -> usize {
        self.state.lock().unwrap().handlers.len()
    }

    pub fn registrations(&self) -> usize {
        self.state.lock().unwrap().registrations
    }

    pub fn removal_attempts(&self) -> usize {
        self.state.lock().unwrap().removal_attempts
    }

    pub fn introspections_of(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .introspections
            .iter()
            .filter(|p| *p == path)
            .count()
    }

    pub fn total_introspections(&self) -> usize {
        self.state.lock().unwrap().introspections.len()
    }

    pub fn calls(&self) -> Vec<(String, MethodCall)> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Announce every interface currently stored for `path`.
    pub async fn emit_added(&self, path: &str) {
        let interfaces = self
            .state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .cloned()
            .unwrap_or_default();
        self.emit(Notification::InterfacesAdded {
            path: path.to_string(),
            interfaces,
        })
        .await;
    }

    pub async fn emit_removed(&self, path: &str, kind: InterfaceKind) {
        self.emit(Notification::InterfacesRemoved {
            path: path.to_string(),
            interfaces: vec![kind.name().to_string()],
        })
        .await;
    }

    /// Deliver to every matching handler in registration order. Handlers
    /// run outside the state lock.
    pub async fn emit(&self, notification: Notification) {
        let handlers: Vec<SignalHandler> = self
            .state
            .lock()
            .unwrap()
            .handlers
            .values()
            .filter(|(kind, _)| *kind == notification.kind())
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(notification.clone()).await;
        }
    }
}

#[async_trait]
impl Bus for MockBus {
    fn remote_object(&self, path: &str, kind: InterfaceKind) -> Option<Arc<dyn RemoteObject>> {
        Some(Arc::new(MockObject {
            path: path.to_string(),
            kind,
            state: Arc::clone(&self.state),
        }))
    }

    async fn introspect(&self, path: &str) -> Result<String, BusError> {
        let (reply, gate) = {
            let mut state = self.state.lock().unwrap();
            let gate = state.held_introspections.remove(path);
            (render_introspection(&mut state, path), gate)
        };

        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        reply
    }

    async fn add_signal_handler(
        &self,
        kind: SignalKind,
        handler: SignalHandler,
    ) -> Result<HandlerToken, BusError> {
        let mut state = self.state.lock().unwrap();
        state.next_token += 1;
        state.registrations += 1;
        let token = state.next_token;
        state.handlers.insert(token, (kind, handler));
        Ok(HandlerToken(token))
    }

    async fn remove_signal_handler(&self, token: HandlerToken) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        state.removal_attempts += 1;
        if state.failing_removals > 0 {
            state.failing_removals -= 1;
            return Err(BusError::failed("connection reset"));
        }
        state
            .handlers
            .remove(&token.0)
            .map(|_| ())
            .ok_or_else(|| BusError::failed(format!("unknown handler {}", token.0)))
    }
}

fn render_introspection(state: &mut State, path: &str) -> Result<String, BusError> {
    state.introspections.push(path.to_string());
    if state.failing_introspections.contains(path) {
        return Err(BusError::new(
            "org.freedesktop.DBus.Error.UnknownObject",
            format!("No such object {path}"),
        ));
    }

    let prefix = format!("{path}/");
    let children: BTreeSet<&str> = state
        .objects
        .keys()
        .filter_map(|key| key.strip_prefix(&prefix))
        .filter_map(|rest| rest.split('/').next())
        .collect();

    let mut xml = String::from("<node>\n  <interface name=\"org.freedesktop.DBus.Introspectable\"/>\n");
    for child in children {
        xml.push_str(&format!("  <node name=\"{child}\"/>\n"));
    }
    xml.push_str("</node>");
    Ok(xml)
}

#[derive(Debug)]
struct MockObject {
    path: String,
    kind: InterfaceKind,
    state: Arc<Mutex<State>>,
}

impl MockObject {
    fn unknown(&self) -> BusError {
        BusError::new(
            "org.freedesktop.DBus.Error.UnknownObject",
            format!("{} has no {}", self.path, self.kind.name()),
        )
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State").field("objects", &self.objects).finish()
    }
}

#[async_trait]
impl RemoteObject for MockObject {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    async fn call(&self, call: MethodCall) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let refused = state.refuse_discovery && call == MethodCall::StartDiscovery;
        state.calls.push((self.path.clone(), call));
        if refused {
            return Err(BusError::new("org.bluez.Error.NotReady", "Resource Not Ready"));
        }
        Ok(())
    }

    async fn get_property(&self, name: &str) -> Result<Value, BusError> {
        self.get_all_properties()
            .await?
            .remove(name)
            .ok_or_else(|| BusError::new("org.freedesktop.DBus.Error.InvalidArgs", name))
    }

    async fn get_all_properties(&self) -> Result<PropertyBag, BusError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&self.path)
            .and_then(|interfaces| interfaces.get(self.kind.name()))
            .cloned()
            .ok_or_else(|| self.unknown())
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let props = state
            .objects
            .get_mut(&self.path)
            .and_then(|interfaces| interfaces.get_mut(self.kind.name()))
            .ok_or_else(|| self.unknown())?;
        props.insert(name.to_string(), value);
        Ok(())
    }
}
