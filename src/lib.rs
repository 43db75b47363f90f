//! BLE connectivity for cycling sensors.
//!
//! Discovers trainers (Fitness Machine Service) and heart-rate monitors,
//! decodes their notifications and keeps one merged [`CyclingMetrics`]
//! snapshot up to date, falling back to simulated data when no hardware
//! is available.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{ConnectionStatus, CyclingMetrics, DeviceDescriptor, DeviceId};
pub use domain::settings::{BluetoothSettings, Settings, SettingsService};
pub use error::{BleError, ParseError};
pub use infrastructure::bluetooth::platform::{resolve_platform, BlePlatform};
pub use infrastructure::bluetooth::BluetoothService;
