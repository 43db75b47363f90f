//! GATT identifiers for the services and characteristics this crate understands.
//!
//! Every id wraps a full 128-bit UUID so devices advertising vendor services
//! can still be represented, while the SIG-assigned 16-bit aliases are
//! available as associated constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bluetooth Base UUID: 0000xxxx-0000-1000-8000-00805F9B34FB
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SHORT_UUID_MASK: u128 = 0xffff_ffff << 96;

/// Expand a 16-bit SIG alias into a full UUID.
pub const fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit alias of a UUID built on the Bluetooth base, if any.
pub fn short_from_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !SHORT_UUID_MASK != BLUETOOTH_BASE_UUID || value >> 112 != 0 {
        return None;
    }
    Some((value >> 96) as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub const HEART_RATE: Self = Self(uuid_from_short(0x180D));
    pub const FITNESS_MACHINE: Self = Self(uuid_from_short(0x1826));
    pub const CYCLING_POWER: Self = Self(uuid_from_short(0x1818));
    pub const CYCLING_SPEED_CADENCE: Self = Self(uuid_from_short(0x1816));
    pub const DEVICE_INFORMATION: Self = Self(uuid_from_short(0x180A));

    /// Services that identify a device as a fitness sensor.
    pub const FITNESS: [Self; 4] = [
        Self::FITNESS_MACHINE,
        Self::CYCLING_POWER,
        Self::CYCLING_SPEED_CADENCE,
        Self::HEART_RATE,
    ];

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    pub fn name(&self) -> Option<&'static str> {
        match short_from_uuid(&self.0)? {
            0x180D => Some("Heart Rate"),
            0x1826 => Some("Fitness Machine"),
            0x1818 => Some("Cycling Power"),
            0x1816 => Some("Cycling Speed and Cadence"),
            0x180A => Some("Device Information"),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub const HEART_RATE_MEASUREMENT: Self = Self(uuid_from_short(0x2A37));
    pub const INDOOR_BIKE_DATA: Self = Self(uuid_from_short(0x2AD2));
    pub const FITNESS_MACHINE_FEATURE: Self = Self(uuid_from_short(0x2ACC));
    pub const CYCLING_POWER_MEASUREMENT: Self = Self(uuid_from_short(0x2A63));
    pub const MANUFACTURER_NAME: Self = Self(uuid_from_short(0x2A29));
    pub const MODEL_NUMBER: Self = Self(uuid_from_short(0x2A24));
    pub const SERIAL_NUMBER: Self = Self(uuid_from_short(0x2A25));
    pub const FIRMWARE_REVISION: Self = Self(uuid_from_short(0x2A26));

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    pub fn name(&self) -> Option<&'static str> {
        match short_from_uuid(&self.0)? {
            0x2A37 => Some("Heart Rate Measurement"),
            0x2AD2 => Some("Indoor Bike Data"),
            0x2ACC => Some("Fitness Machine Feature"),
            0x2A63 => Some("Cycling Power Measurement"),
            0x2A29 => Some("Manufacturer Name"),
            0x2A24 => Some("Model Number"),
            0x2A25 => Some("Serial Number"),
            0x2A26 => Some("Firmware Revision"),
            _ => None,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}
