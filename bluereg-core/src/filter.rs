/*!
 * Discovery Filter
 * Validated SetDiscoveryFilter options; nothing is sent until every entry checks out
 */

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::bus::{PropertyBag, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterKey {
    Uuids,
    Rssi,
    Pathloss,
    Transport,
    DuplicateData,
    Discoverable,
    Pattern,
}

impl FilterKey {
    pub fn property_name(self) -> &'static str {
        match self {
            FilterKey::Uuids => "UUIDs",
            FilterKey::Rssi => "RSSI",
            FilterKey::Pathloss => "Pathloss",
            FilterKey::Transport => "Transport",
            FilterKey::DuplicateData => "DuplicateData",
            FilterKey::Discoverable => "Discoverable",
            FilterKey::Pattern => "Pattern",
        }
    }

    fn expected_type(self) -> &'static str {
        match self {
            FilterKey::Uuids => "string array",
            FilterKey::Rssi => "int16",
            FilterKey::Pathloss => "uint16",
            FilterKey::Transport | FilterKey::Pattern => "string",
            FilterKey::DuplicateData | FilterKey::Discoverable => "boolean",
        }
    }

    fn validate(self, value: &Value) -> Result<()> {
        let type_ok = matches!(
            (self, value),
            (FilterKey::Uuids, Value::StrArray(_))
                | (FilterKey::Rssi, Value::Int16(_))
                | (FilterKey::Pathloss, Value::UInt16(_))
                | (FilterKey::Transport, Value::Str(_))
                | (FilterKey::Pattern, Value::Str(_))
                | (FilterKey::DuplicateData, Value::Bool(_))
                | (FilterKey::Discoverable, Value::Bool(_))
        );
        if !type_ok {
            return Err(Error::InvalidArguments(format!(
                "Filter value for {} not of required type {} (got {})",
                self.property_name(),
                self.expected_type(),
                value.type_name()
            )));
        }

        match value {
            Value::StrArray(uuids) => {
                if let Some(bad) = uuids.iter().find(|u| Uuid::parse_str(u).is_err()) {
                    return Err(Error::InvalidArguments(format!("Invalid UUID in filter: {bad}")));
                }
            }
            Value::Str(transport) if self == FilterKey::Transport => {
                transport.parse::<Transport>()?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.property_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Auto,
    BrEdr,
    Le,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Auto => "auto",
            Transport::BrEdr => "bredr",
            Transport::Le => "le",
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Transport::Auto),
            "bredr" => Ok(Transport::BrEdr),
            "le" => Ok(Transport::Le),
            other => Err(Error::InvalidArguments(format!("Unknown transport: {other}"))),
        }
    }
}

impl From<Transport> for Value {
    fn from(t: Transport) -> Self {
        Value::Str(t.as_str().to_string())
    }
}

/// A set of discovery filter options, each checked against the type
/// BlueZ expects for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryFilter {
    entries: BTreeMap<FilterKey, Value>,
}

impl DiscoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate every entry up front; the first bad one fails the whole filter.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (FilterKey, Value)>,
    {
        entries
            .into_iter()
            .try_fold(Self::new(), |filter, (key, value)| filter.with(key, value))
    }

    pub fn with(mut self, key: FilterKey, value: impl Into<Value>) -> Result<Self> {
        let value = value.into();
        key.validate(&value)?;
        self.entries.insert(key, value);
        Ok(self)
    }

    pub fn get(&self, key: FilterKey) -> Option<&Value> {
        self.entries.get(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Argument for `SetDiscoveryFilter`. An empty bag clears the filter.
    pub fn to_properties(&self) -> PropertyBag {
        self.entries
            .iter()
            .map(|(key, value)| (key.property_name().to_string(), value.clone()))
            .collect()
    }
}
