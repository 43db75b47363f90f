use crate::domain::gatt::{CharacteristicId, ServiceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Opaque platform address of a BLE peripheral (48-bit MAC packed in a u64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    /// Accepts `AABBCCDDEEFF` as well as `AA:BB:CC:DD:EE:FF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        u64::from_str_radix(&hex, 16).map(DeviceId)
    }
}

/// A peripheral seen during a scan. Re-discovery produces a new descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub advertised_service_ids: BTreeSet<ServiceId>,
    pub signal_strength: i16,
    pub connectable: bool,
}

impl DeviceDescriptor {
    pub fn advertises(&self, service: ServiceId) -> bool {
        self.advertised_service_ids.contains(&service)
    }

    /// Human readable classification based on advertised services.
    pub fn device_type(&self) -> &'static str {
        if self.advertises(ServiceId::FITNESS_MACHINE) {
            "Smart Trainer"
        } else if self.advertises(ServiceId::CYCLING_POWER) {
            "Power Meter"
        } else if self.advertises(ServiceId::CYCLING_SPEED_CADENCE) {
            "Speed/Cadence Sensor"
        } else if self.advertises(ServiceId::HEART_RATE) {
            "Heart Rate Monitor"
        } else {
            "Unknown Fitness Device"
        }
    }
}

/// Which optional fields a decoded frame actually carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldMask(u16);

impl FieldMask {
    pub const POWER: Self = Self(0x0001);
    pub const CADENCE: Self = Self(0x0002);
    pub const SPEED: Self = Self(0x0004);
    pub const DISTANCE: Self = Self(0x0008);
    pub const RESISTANCE: Self = Self(0x0010);
    pub const HEART_RATE: Self = Self(0x0020);
    pub const ENERGY: Self = Self(0x0040);
    pub const ELAPSED_TIME: Self = Self(0x0080);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One decoded telemetry frame. Built once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainerSample {
    power: Option<i16>,
    cadence: Option<f64>,
    speed: Option<f64>,
    distance_meters: Option<u32>,
    resistance_level: Option<i16>,
    heart_rate: Option<u8>,
    expended_energy_kcal: Option<u16>,
    elapsed_time: Option<Duration>,
    valid: FieldMask,
}

impl TrainerSample {
    pub fn with_power(mut self, watts: i16) -> Self {
        self.power = Some(watts);
        self.valid = self.valid.union(FieldMask::POWER);
        self
    }

    pub fn with_cadence(mut self, rpm: f64) -> Self {
        self.cadence = Some(rpm);
        self.valid = self.valid.union(FieldMask::CADENCE);
        self
    }

    pub fn with_speed(mut self, kmh: f64) -> Self {
        self.speed = Some(kmh);
        self.valid = self.valid.union(FieldMask::SPEED);
        self
    }

    pub fn with_distance(mut self, meters: u32) -> Self {
        self.distance_meters = Some(meters);
        self.valid = self.valid.union(FieldMask::DISTANCE);
        self
    }

    pub fn with_resistance_level(mut self, level: i16) -> Self {
        self.resistance_level = Some(level);
        self.valid = self.valid.union(FieldMask::RESISTANCE);
        self
    }

    pub fn with_heart_rate(mut self, bpm: u8) -> Self {
        self.heart_rate = Some(bpm);
        self.valid = self.valid.union(FieldMask::HEART_RATE);
        self
    }

    pub fn with_expended_energy(mut self, kcal: u16) -> Self {
        self.expended_energy_kcal = Some(kcal);
        self.valid = self.valid.union(FieldMask::ENERGY);
        self
    }

    pub fn with_elapsed_time(mut self, elapsed: Duration) -> Self {
        self.elapsed_time = Some(elapsed);
        self.valid = self.valid.union(FieldMask::ELAPSED_TIME);
        self
    }

    pub fn power(&self) -> Option<i16> {
        self.power
    }

    pub fn cadence(&self) -> Option<f64> {
        self.cadence
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    pub fn distance_meters(&self) -> Option<u32> {
        self.distance_meters
    }

    pub fn resistance_level(&self) -> Option<i16> {
        self.resistance_level
    }

    pub fn heart_rate(&self) -> Option<u8> {
        self.heart_rate
    }

    pub fn expended_energy_kcal(&self) -> Option<u16> {
        self.expended_energy_kcal
    }

    pub fn elapsed_time(&self) -> Option<Duration> {
        self.elapsed_time
    }

    pub fn valid_fields(&self) -> FieldMask {
        self.valid
    }
}

/// Decoded Heart Rate Measurement (0x2A37).
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    /// RR intervals in seconds.
    pub rr_intervals: Vec<f64>,
}

impl HeartRateMeasurement {
    pub fn to_sample(&self) -> TrainerSample {
        TrainerSample::default().with_heart_rate(u8::try_from(self.bpm).unwrap_or(u8::MAX))
    }
}

/// The merged snapshot handed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclingMetrics {
    pub watts: i32,
    pub cadence: f64,
    pub speed: f64,
    pub heart_rate: u16,
    pub timestamp: DateTime<Utc>,
}

impl CyclingMetrics {
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self {
            watts: 0,
            cadence: 0.0,
            speed: 0.0,
            heart_rate: 0,
            timestamp,
        }
    }

    /// Overlay the fields `sample` carries; everything else is kept.
    pub fn merged(&self, sample: &TrainerSample, timestamp: DateTime<Utc>) -> Self {
        Self {
            watts: sample.power().map(i32::from).unwrap_or(self.watts),
            cadence: sample.cadence().unwrap_or(self.cadence),
            speed: sample.speed().unwrap_or(self.speed),
            heart_rate: sample.heart_rate().map(u16::from).unwrap_or(self.heart_rate),
            timestamp: timestamp.max(self.timestamp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Active,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Payload of the connection status event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub device_names: Vec<String>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Device Information Service contents plus the FTMS feature bitmask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub manufacturer_name: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub supported_features: u32,
}

impl DeviceInformation {
    pub fn supports_feature(&self, feature: u32) -> bool {
        self.supported_features & feature == feature
    }
}

/// Read-only view of one connected device.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub descriptor: DeviceDescriptor,
    pub state: ConnectionState,
    pub subscribed_characteristics: BTreeSet<CharacteristicId>,
    pub device_info: Option<DeviceInformation>,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
