use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accessory category code as advertised by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub u16);

impl Category {
    pub const OTHER: Self = Self(1);
    pub const BRIDGE: Self = Self(2);
    pub const FAN: Self = Self(3);
    pub const GARAGE_DOOR_OPENER: Self = Self(4);
    pub const LIGHTBULB: Self = Self(5);
    pub const DOOR_LOCK: Self = Self(6);
    pub const OUTLET: Self = Self(7);
    pub const SWITCH: Self = Self(8);
    pub const THERMOSTAT: Self = Self(9);
    pub const SENSOR: Self = Self(10);
    pub const ALARM_SYSTEM: Self = Self(11);
    pub const DOOR: Self = Self(12);
    pub const WINDOW: Self = Self(13);
    pub const WINDOW_COVERING: Self = Self(14);
    pub const PROGRAMMABLE_SWITCH: Self = Self(15);
    pub const RANGE_EXTENDER: Self = Self(16);
    pub const IP_CAMERA: Self = Self(17);
    pub const VIDEO_DOORBELL: Self = Self(18);
    pub const AIR_PURIFIER: Self = Self(19);
    pub const AIR_HEATER: Self = Self(20);
    pub const AIR_CONDITIONER: Self = Self(21);
    pub const AIR_HUMIDIFIER: Self = Self(22);
    pub const AIR_DEHUMIDIFIER: Self = Self(23);
    pub const APPLE_TV: Self = Self(24);
    pub const HOMEPOD: Self = Self(25);
    pub const SPEAKER: Self = Self(26);
    pub const AIRPORT: Self = Self(27);
    pub const SPRINKLER: Self = Self(28);
    pub const FAUCET: Self = Self(29);
    pub const SHOWER_HEAD: Self = Self(30);
    pub const TELEVISION: Self = Self(31);
    pub const TARGET_CONTROLLER: Self = Self(32);
    pub const ROUTER: Self = Self(33);
    pub const AUDIO_RECEIVER: Self = Self(34);
    pub const TV_SET_TOP_BOX: Self = Self(35);
    pub const TV_STREAMING_STICK: Self = Self(36);
}

impl Default for Category {
    fn default() -> Self {
        Self::OTHER
    }
}

/// Stable accessory UUID derived from `seed`.
///
/// Plugins call this with something unique to the device (serial number,
/// address) so the same device maps to the same accessory after a restart.
pub fn generate_uuid(seed: impl AsRef<[u8]>) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_ref()).to_string()
}

/// True for the hyphenated 36-character form the protocol engine expects.
pub fn is_valid_uuid(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}
