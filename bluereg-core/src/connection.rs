/*!
 * D-Bus Connection
 * Bus implementation over dbus-tokio: org.bluez proxies, introspection,
 * and ObjectManager/Properties signal matches
 */

use async_trait::async_trait;
use dbus::arg::{AppendAll, ArgType, PropMap, RefArg, Variant};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{Introspectable, Properties};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Path;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::bus::{
    Bus, BusError, HandlerToken, InterfaceKind, MethodCall, Notification, PropertyBag,
    RemoteObject, SignalHandler, SignalKind, Value, BLUEZ_SERVICE,
};

const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

impl From<dbus::Error> for BusError {
    fn from(err: dbus::Error) -> Self {
        Self {
            name: err.name().map(str::to_string),
            message: err.message().unwrap_or_default().to_string(),
        }
    }
}

struct ActiveMatch {
    msg_match: MsgMatch,
    pump: JoinHandle<()>,
}

/// Shared system (or session) bus connection talking to `org.bluez`.
pub struct DbusBus {
    conn: Arc<SyncConnection>,
    timeout: Duration,
    matches: Mutex<HashMap<HandlerToken, ActiveMatch>>,
    next_token: AtomicU64,
}

impl DbusBus {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Open the bus and spawn the task driving it. Must run inside a
    /// Tokio runtime; the returned handle finishes when the connection is lost.
    pub fn connect(session: bool) -> Result<(Self, JoinHandle<()>), BusError> {
        let (resource, conn) = if session {
            dbus_tokio::connection::new_session_sync()?
        } else {
            dbus_tokio::connection::new_system_sync()?
        };

        let driver = tokio::spawn(async move {
            let err = resource.await;
            error!("Lost connection to D-Bus: {}", err);
        });

        debug!("Connected to the {} bus", if session { "session" } else { "system" });
        Ok((Self::from_connection(conn), driver))
    }

    pub fn from_connection(conn: Arc<SyncConnection>) -> Self {
        Self {
            conn,
            timeout: Self::DEFAULT_CALL_TIMEOUT,
            matches: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn proxy(&self, path: Path<'static>) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_SERVICE, path, self.timeout, Arc::clone(&self.conn))
    }
}

#[async_trait]
impl Bus for DbusBus {
    fn remote_object(&self, path: &str, kind: InterfaceKind) -> Option<Arc<dyn RemoteObject>> {
        let object_path = Path::new(path.to_string()).ok()?;
        Some(Arc::new(DbusObject {
            path: path.to_string(),
            kind,
            proxy: self.proxy(object_path),
        }))
    }

    async fn introspect(&self, path: &str) -> Result<String, BusError> {
        let proxy = self.proxy(object_path(path)?);
        Ok(Introspectable::introspect(&proxy).await?)
    }

    async fn add_signal_handler(
        &self,
        kind: SignalKind,
        handler: SignalHandler,
    ) -> Result<HandlerToken, BusError> {
        let rule = match kind {
            SignalKind::InterfacesAdded => MatchRule::new_signal(OBJECT_MANAGER, "InterfacesAdded"),
            SignalKind::InterfacesRemoved => MatchRule::new_signal(OBJECT_MANAGER, "InterfacesRemoved"),
            SignalKind::PropertiesChanged => MatchRule::new_signal(PROPERTIES, "PropertiesChanged"),
        }
        .with_sender(BLUEZ_SERVICE);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg_match = self.conn.add_match(rule).await?;
        let msg_match = match kind {
            SignalKind::InterfacesAdded => msg_match.cb(
                move |_, (path, interfaces): (Path<'static>, HashMap<String, PropMap>)| {
                    let interfaces = interfaces
                        .iter()
                        .map(|(name, props)| (name.clone(), bag_from_prop_map(props)))
                        .collect();
                    tx.send(Notification::InterfacesAdded {
                        path: path.to_string(),
                        interfaces,
                    })
                    .is_ok()
                },
            ),
            SignalKind::InterfacesRemoved => msg_match.cb(
                move |_, (path, interfaces): (Path<'static>, Vec<String>)| {
                    tx.send(Notification::InterfacesRemoved {
                        path: path.to_string(),
                        interfaces,
                    })
                    .is_ok()
                },
            ),
            SignalKind::PropertiesChanged => msg_match.cb(
                move |msg, (interface, changed, invalidated): (String, PropMap, Vec<String>)| {
                    let path = msg.path().map(|p| p.to_string()).unwrap_or_default();
                    tx.send(Notification::PropertiesChanged {
                        path,
                        interface,
                        changed: bag_from_prop_map(&changed),
                        invalidated,
                    })
                    .is_ok()
                },
            ),
        };

        // one pump per handler keeps delivery ordered
        let pump = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                handler(notification).await;
            }
        });

        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.matches
            .lock()
            .await
            .insert(token, ActiveMatch { msg_match, pump });
        debug!("Added {:?} match as handler {}", kind, token.0);
        Ok(token)
    }

    async fn remove_signal_handler(&self, token: HandlerToken) -> Result<(), BusError> {
        let Some(active) = self.matches.lock().await.remove(&token) else {
            return Err(BusError::new(
                "org.freedesktop.DBus.Error.MatchRuleNotFound",
                format!("No signal handler {}", token.0),
            ));
        };

        active.pump.abort();
        self.conn.remove_match(active.msg_match.token()).await?;
        debug!("Removed signal handler {}", token.0);
        Ok(())
    }
}

/// One BlueZ interface of one object path.
struct DbusObject {
    path: String,
    kind: InterfaceKind,
    proxy: Proxy<'static, Arc<SyncConnection>>,
}

impl fmt::Debug for DbusObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbusObject")
            .field("path", &self.path)
            .field("interface", &self.kind.name())
            .finish()
    }
}

impl DbusObject {
    async fn invoke<A: AppendAll>(&self, member: &'static str, args: A) -> Result<(), BusError> {
        Ok(self.proxy.method_call(self.kind.name(), member, args).await?)
    }
}

#[async_trait]
impl RemoteObject for DbusObject {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    async fn call(&self, call: MethodCall) -> Result<(), BusError> {
        if call.interface() != self.kind {
            return Err(BusError::new(
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!("{} is not a member of {}", call.member(), self.kind.name()),
            ));
        }

        let member = call.member();
        match call {
            MethodCall::StartDiscovery
            | MethodCall::StopDiscovery
            | MethodCall::Pair
            | MethodCall::CancelPairing
            | MethodCall::Connect
            | MethodCall::Disconnect => self.invoke(member, ()).await,
            MethodCall::SetDiscoveryFilter(filter) => {
                self.invoke(member, (to_prop_map(&filter),)).await
            }
            MethodCall::RemoveDevice(path)
            | MethodCall::RequestDefaultAgent(path)
            | MethodCall::UnregisterAgent(path)
            | MethodCall::UnregisterProfile(path) => {
                self.invoke(member, (object_path(&path)?,)).await
            }
            MethodCall::RegisterAgent { path, capability } => {
                self.invoke(member, (object_path(&path)?, capability)).await
            }
            MethodCall::RegisterProfile { path, uuid, options } => {
                self.invoke(member, (object_path(&path)?, uuid, to_prop_map(&options)))
                    .await
            }
        }
    }

    async fn get_property(&self, name: &str) -> Result<Value, BusError> {
        let raw: Box<dyn RefArg> = Properties::get(&self.proxy, self.kind.name(), name).await?;
        value_from_ref_arg(&*raw).ok_or_else(|| {
            BusError::failed(format!("Unsupported value type for property {name}"))
        })
    }

    async fn get_all_properties(&self) -> Result<PropertyBag, BusError> {
        let props = Properties::get_all(&self.proxy, self.kind.name()).await?;
        Ok(bag_from_prop_map(&props))
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), BusError> {
        let iface = self.kind.name();
        let proxy = &self.proxy;
        let reply = match value {
            Value::Bool(v) => Properties::set(proxy, iface, name, v).await,
            Value::Byte(v) => Properties::set(proxy, iface, name, v).await,
            Value::Int16(v) => Properties::set(proxy, iface, name, v).await,
            Value::UInt16(v) => Properties::set(proxy, iface, name, v).await,
            Value::Int32(v) => Properties::set(proxy, iface, name, v).await,
            Value::UInt32(v) => Properties::set(proxy, iface, name, v).await,
            Value::Int64(v) => Properties::set(proxy, iface, name, v).await,
            Value::UInt64(v) => Properties::set(proxy, iface, name, v).await,
            Value::Double(v) => Properties::set(proxy, iface, name, v).await,
            Value::Str(v) => Properties::set(proxy, iface, name, v).await,
            Value::ObjectPath(v) => Properties::set(proxy, iface, name, object_path(&v)?).await,
            Value::StrArray(v) => Properties::set(proxy, iface, name, v).await,
            Value::Bytes(v) => Properties::set(proxy, iface, name, v).await,
        };
        Ok(reply?)
    }
}

fn object_path(path: &str) -> Result<Path<'static>, BusError> {
    Path::new(path.to_string()).map_err(|err| BusError::new(INVALID_ARGS, err))
}

/// Convert one wire value; types the registry has no use for yield `None`.
fn value_from_ref_arg(arg: &dyn RefArg) -> Option<Value> {
    match arg.arg_type() {
        ArgType::Boolean => arg.as_u64().map(|v| Value::Bool(v != 0)),
        ArgType::Byte => arg.as_u64().and_then(|v| u8::try_from(v).ok()).map(Value::Byte),
        ArgType::Int16 => arg.as_i64().and_then(|v| i16::try_from(v).ok()).map(Value::Int16),
        ArgType::UInt16 => arg.as_u64().and_then(|v| u16::try_from(v).ok()).map(Value::UInt16),
        ArgType::Int32 => arg.as_i64().and_then(|v| i32::try_from(v).ok()).map(Value::Int32),
        ArgType::UInt32 => arg.as_u64().and_then(|v| u32::try_from(v).ok()).map(Value::UInt32),
        ArgType::Int64 => arg.as_i64().map(Value::Int64),
        ArgType::UInt64 => arg.as_u64().map(Value::UInt64),
        ArgType::Double => arg.as_f64().map(Value::Double),
        ArgType::String => arg.as_str().map(|s| Value::Str(s.to_string())),
        ArgType::ObjectPath => arg.as_str().map(|s| Value::ObjectPath(s.to_string())),
        ArgType::Variant => arg.as_iter()?.next().and_then(value_from_ref_arg),
        ArgType::Array => match &*arg.signature() {
            "ay" => arg
                .as_iter()?
                .map(|b| b.as_u64().and_then(|v| u8::try_from(v).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(Value::Bytes),
            "as" | "ao" => arg
                .as_iter()?
                .map(|s| s.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
                .map(Value::StrArray),
            _ => None,
        },
        _ => None,
    }
}

fn bag_from_prop_map(props: &PropMap) -> PropertyBag {
    props
        .iter()
        .filter_map(|(name, value)| Some((name.clone(), value_from_ref_arg(&*value.0)?)))
        .collect()
}

fn to_ref_arg(value: &Value) -> Box<dyn RefArg> {
    match value {
        Value::Bool(v) => Box::new(*v),
        Value::Byte(v) => Box::new(*v),
        Value::Int16(v) => Box::new(*v),
        Value::UInt16(v) => Box::new(*v),
        Value::Int32(v) => Box::new(*v),
        Value::UInt32(v) => Box::new(*v),
        Value::Int64(v) => Box::new(*v),
        Value::UInt64(v) => Box::new(*v),
        Value::Double(v) => Box::new(*v),
        Value::Str(v) => Box::new(v.clone()),
        Value::ObjectPath(v) => match Path::new(v.clone()) {
            Ok(path) => Box::new(path),
            Err(_) => Box::new(v.clone()),
        },
        Value::StrArray(v) => Box::new(v.clone()),
        Value::Bytes(v) => Box::new(v.clone()),
    }
}

fn to_prop_map(bag: &PropertyBag) -> PropMap {
    bag.iter()
        .map(|(name, value)| (name.clone(), Variant(to_ref_arg(value))))
        .collect()
}
