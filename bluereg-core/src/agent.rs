/*!
 * Agent and Profile Managers
 * Registration calls on /org/bluez for externally exported pairing agents
 * and profiles
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{Bus, InterfaceKind, MethodCall, PropertyBag, RemoteObject, BLUEZ_ROOT};
use crate::error::{Error, Result};

/// IO capability announced when registering a pairing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    #[default]
    NoInputNoOutput,
    KeyboardDisplay,
}

impl AgentCapability {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCapability::DisplayOnly => "DisplayOnly",
            AgentCapability::DisplayYesNo => "DisplayYesNo",
            AgentCapability::KeyboardOnly => "KeyboardOnly",
            AgentCapability::NoInputNoOutput => "NoInputNoOutput",
            AgentCapability::KeyboardDisplay => "KeyboardDisplay",
        }
    }
}

impl fmt::Display for AgentCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentCapability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            AgentCapability::DisplayOnly,
            AgentCapability::DisplayYesNo,
            AgentCapability::KeyboardOnly,
            AgentCapability::NoInputNoOutput,
            AgentCapability::KeyboardDisplay,
        ]
        .into_iter()
        .find(|capability| capability.as_str() == s)
        .ok_or_else(|| Error::InvalidArguments(format!("Unknown agent capability: {s}")))
    }
}

/// `org.bluez.AgentManager1`.
#[derive(Debug, Clone)]
pub struct AgentManager {
    proxy: Arc<dyn RemoteObject>,
}

impl AgentManager {
    pub fn new(bus: &dyn Bus) -> Option<Self> {
        let proxy = bus.remote_object(BLUEZ_ROOT, InterfaceKind::AgentManager)?;
        Some(Self { proxy })
    }

    /// Register the agent exported at `path`. Registering the same agent
    /// again is not an error.
    pub async fn register_agent(&self, path: &str, capability: AgentCapability) -> Result<()> {
        let call = MethodCall::RegisterAgent {
            path: path.to_string(),
            capability: capability.as_str().to_string(),
        };
        match self.proxy.call(call).await.map_err(Error::from) {
            Ok(()) => {
                info!("Registered agent {} ({})", path, capability);
                Ok(())
            }
            Err(Error::AlreadyExists(_)) => {
                debug!("Agent {} already registered", path);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// `Ok(false)` when BlueZ does not know the agent.
    pub async fn request_default_agent(&self, path: &str) -> Result<bool> {
        let call = MethodCall::RequestDefaultAgent(path.to_string());
        absent_is_false(self.proxy.call(call).await.map_err(Error::from))
    }

    pub async fn unregister_agent(&self, path: &str) -> Result<bool> {
        let call = MethodCall::UnregisterAgent(path.to_string());
        absent_is_false(self.proxy.call(call).await.map_err(Error::from))
    }
}

/// `org.bluez.ProfileManager1`.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    proxy: Arc<dyn RemoteObject>,
}

impl ProfileManager {
    pub fn new(bus: &dyn Bus) -> Option<Self> {
        let proxy = bus.remote_object(BLUEZ_ROOT, InterfaceKind::ProfileManager)?;
        Some(Self { proxy })
    }

    pub async fn register_profile(&self, path: &str, uuid: &str, options: PropertyBag) -> Result<()> {
        let uuid = Uuid::parse_str(uuid)
            .map_err(|err| Error::InvalidArguments(format!("Invalid profile UUID {uuid}: {err}")))?;

        let call = MethodCall::RegisterProfile {
            path: path.to_string(),
            uuid: uuid.hyphenated().to_string(),
            options,
        };
        match self.proxy.call(call).await.map_err(Error::from) {
            Ok(()) => {
                info!("Registered profile {} for {}", path, uuid);
                Ok(())
            }
            Err(Error::AlreadyExists(_)) => {
                debug!("Profile {} already registered", path);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn unregister_profile(&self, path: &str) -> Result<bool> {
        let call = MethodCall::UnregisterProfile(path.to_string());
        absent_is_false(self.proxy.call(call).await.map_err(Error::from))
    }
}

fn absent_is_false(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(Error::DoesNotExist(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, HandlerToken, SignalHandler, SignalKind, Value};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<MethodCall>>,
        reply: Mutex<Option<BusError>>,
    }

    #[async_trait]
    impl RemoteObject for Recorder {
        fn path(&self) -> &str {
            BLUEZ_ROOT
        }

        fn kind(&self) -> InterfaceKind {
            InterfaceKind::AgentManager
        }

        async fn call(&self, call: MethodCall) -> std::result::Result<(), BusError> {
            self.calls.lock().unwrap().push(call);
            match self.reply.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn get_property(&self, _name: &str) -> std::result::Result<Value, BusError> {
            Err(BusError::failed("unused"))
        }

        async fn get_all_properties(&self) -> std::result::Result<PropertyBag, BusError> {
            Err(BusError::failed("unused"))
        }

        async fn set_property(&self, _name: &str, _value: Value) -> std::result::Result<(), BusError> {
            Err(BusError::failed("unused"))
        }
    }

    struct RootBus(Arc<Recorder>);

    #[async_trait]
    impl Bus for RootBus {
        fn remote_object(&self, path: &str, _kind: InterfaceKind) -> Option<Arc<dyn RemoteObject>> {
            (path == BLUEZ_ROOT).then(|| Arc::clone(&self.0) as Arc<dyn RemoteObject>)
        }

        async fn introspect(&self, _path: &str) -> std::result::Result<String, BusError> {
            Ok("<node/>".into())
        }

        async fn add_signal_handler(
            &self,
            _kind: SignalKind,
            _handler: SignalHandler,
        ) -> std::result::Result<HandlerToken, BusError> {
            Ok(HandlerToken(0))
        }

        async fn remove_signal_handler(&self, _token: HandlerToken) -> std::result::Result<(), BusError> {
            Ok(())
        }
    }

    fn setup() -> (Arc<Recorder>, RootBus) {
        let recorder = Arc::new(Recorder::default());
        (Arc::clone(&recorder), RootBus(recorder))
    }

    #[tokio::test]
    async fn register_agent_sends_capability() {
        let (recorder, bus) = setup();
        let agents = AgentManager::new(&bus).unwrap();

        agents
            .register_agent("/org/bluereg/agent", AgentCapability::KeyboardDisplay)
            .await
            .unwrap();

        assert_eq!(
            recorder.calls.lock().unwrap().as_slice(),
            &[MethodCall::RegisterAgent {
                path: "/org/bluereg/agent".into(),
                capability: "KeyboardDisplay".into(),
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_registration_is_tolerated() {
        let (recorder, bus) = setup();
        *recorder.reply.lock().unwrap() =
            Some(BusError::new("org.bluez.Error.AlreadyExists", "Already Exists"));

        let agents = AgentManager::new(&bus).unwrap();
        assert!(agents
            .register_agent("/org/bluereg/agent", AgentCapability::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_agent_reports_false() {
        let (recorder, bus) = setup();
        *recorder.reply.lock().unwrap() =
            Some(BusError::new("org.bluez.Error.DoesNotExist", "Does Not Exist"));

        let agents = AgentManager::new(&bus).unwrap();
        assert!(!agents.unregister_agent("/org/bluereg/agent").await.unwrap());
        assert!(!agents.request_default_agent("/org/bluereg/agent").await.unwrap());
    }

    #[tokio::test]
    async fn profile_uuid_is_validated_before_calling() {
        let (recorder, bus) = setup();
        let profiles = ProfileManager::new(&bus).unwrap();

        let err = profiles
            .register_profile("/org/bluereg/spp", "serial", PropertyBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
        assert!(recorder.calls.lock().unwrap().is_empty());

        profiles
            .register_profile(
                "/org/bluereg/spp",
                "00001101-0000-1000-8000-00805F9B34FB",
                PropertyBag::from([("Name".to_string(), Value::from("Serial Port"))]),
            )
            .await
            .unwrap();
        let calls = recorder.calls.lock().unwrap();
        assert!(matches!(
            &calls[0],
            MethodCall::RegisterProfile { uuid, .. } if uuid == "00001101-0000-1000-8000-00805f9b34fb"
        ));
    }

    #[test]
    fn capability_names_round_trip() {
        assert_eq!(
            "DisplayYesNo".parse::<AgentCapability>().unwrap(),
            AgentCapability::DisplayYesNo
        );
        assert!("Telepathy".parse::<AgentCapability>().is_err());
    }
}
