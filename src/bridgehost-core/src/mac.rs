//! MAC-address shaped bridge usernames.
//!
//! Bridges (main and child) are identified by a six-octet, upper-case,
//! colon-separated address. The same identity space is used for bridge
//! credentials and for naming per-bridge cache partitions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;

static MAC_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-F]{2}:){5}[0-9A-F]{2}$").expect("invalid mac address regex")
});

/// True iff `address` is six upper-case hex octets separated by colons.
pub fn valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// Derive a stable, valid MAC address from arbitrary seed bytes.
pub fn generate_mac(seed: impl AsRef<[u8]>) -> String {
    // The first six bytes of a name-based UUID are untouched digest bytes.
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_ref());
    digest.as_bytes()[..6]
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{value}' is not a valid bridge username (expected XX:XX:XX:XX:XX:XX)")]
pub struct InvalidUsername {
    pub value: String,
}

/// Identity of a bridge, shaped like a MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BridgeUsername(String);

impl BridgeUsername {
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidUsername> {
        let value = value.into();
        if valid_mac_address(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidUsername { value })
        }
    }

    /// A username derived from `seed`; the same seed always yields the same username.
    pub fn from_seed(seed: impl AsRef<[u8]>) -> Self {
        Self(generate_mac(seed))
    }

    pub fn random() -> Self {
        Self::from_seed(rand::random::<[u8; 16]>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The username without separators, used in file names.
    pub fn compact(&self) -> String {
        self.0.replace(':', "")
    }
}

impl fmt::Display for BridgeUsername {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BridgeUsername {
    type Err = InvalidUsername;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BridgeUsername {
    type Error = InvalidUsername;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BridgeUsername> for String {
    fn from(value: BridgeUsername) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_address() {
        assert!(valid_mac_address("61:67:0F:6E:B0:48"));
    }

    #[test]
    fn rejects_lower_case() {
        let address = "0E:80:9C:B4:E4:C5";
        assert!(valid_mac_address(address));
        assert!(!valid_mac_address(&address.to_lowercase()));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(!valid_mac_address("25:22:04:2B:3A"));
        assert!(!valid_mac_address("7F:9A:58:0E:87:23:AA"));
    }

    #[test]
    fn generated_addresses_are_valid_and_stable() {
        for seed in ["a", "bridge-1", "", "@scope/homebridge-x"] {
            let generated = generate_mac(seed);
            assert!(valid_mac_address(&generated), "invalid: {generated}");
            assert_eq!(generated, generate_mac(seed));
        }
        assert_ne!(generate_mac("one"), generate_mac("two"));
    }

    #[test]
    fn random_usernames_are_valid() {
        let username = BridgeUsername::random();
        assert!(valid_mac_address(username.as_str()));
    }

    #[test]
    fn compact_strips_separators() {
        let username = BridgeUsername::parse("CC:22:3D:E3:CE:30").unwrap();
        assert_eq!(username.compact(), "CC223DE3CE30");
    }

    #[test]
    fn parse_reports_offending_value() {
        let err = BridgeUsername::parse("cc:22").unwrap_err();
        assert_eq!(err.value, "cc:22");
    }
}
