/*!
 * MAC Address Normalization
 * One canonical key form for addresses written as AA:BB.., aa-bb.. or aa_bb..
 */

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Fold `-` and `_` separators to `:` and lower-case the rest.
pub fn normalize_mac(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '-' | '_' => ':',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// A validated, normalized 48-bit address (`aa:bb:cc:dd:ee:ff`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = normalize_mac(raw);
        let mut octets = 0;
        for part in normalized.split(':') {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            octets += 1;
        }
        (octets == 6).then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| Error::InvalidArguments(format!("not a MAC address: {s}")))
    }
}
