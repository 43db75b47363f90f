//! Platform BLE capability
//!
//! The rest of the crate talks to the radio only through [`BlePlatform`].
//! One implementation exists per backend and [`resolve_platform`] picks one
//! once at startup.
//!
//! - [`memory`] - in-process peripherals, used for simulation mode and tests
//! - `winrt` - WinRT `Windows.Devices.Bluetooth` backend (Windows only)

pub mod memory;
#[cfg(windows)]
pub mod winrt;

use crate::domain::gatt::{CharacteristicId, ServiceId};
use crate::domain::models::DeviceId;
use crate::domain::settings::{BackendKind, BluetoothSettings};
use crate::error::BleError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// One advertisement report as delivered by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub address: DeviceId,
    pub local_name: Option<String>,
    pub service_ids: Vec<ServiceId>,
    pub rssi: i16,
    pub connectable: bool,
}

/// Opaque handle to an open GATT session, minted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattHandle(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub id: CharacteristicId,
    pub properties: CharacteristicProperties,
}

/// Raw notification payload callback. Invoked on stack-owned threads; must not block.
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Fired by the native stack when it notices the link is gone.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Start a native advertisement watch. Reports arrive on the returned
    /// channel until [`BlePlatform::stop_scan`] is called.
    async fn scan_advertisements(
        &self,
        filter: &[ServiceId],
    ) -> Result<mpsc::UnboundedReceiver<RawAdvertisement>, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect_gatt(
        &self,
        address: DeviceId,
        timeout: Duration,
        on_disconnect: DisconnectCallback,
    ) -> Result<GattHandle, BleError>;

    async fn discover_services(&self, handle: GattHandle) -> Result<Vec<ServiceId>, BleError>;

    async fn discover_characteristics(
        &self,
        handle: GattHandle,
        service: ServiceId,
    ) -> Result<Vec<CharacteristicInfo>, BleError>;

    /// Register `on_data` and enable notifications through the CCCD.
    async fn subscribe(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
        on_data: NotificationCallback,
    ) -> Result<(), BleError>;

    async fn unsubscribe(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
    ) -> Result<(), BleError>;

    async fn read_characteristic(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, BleError>;

    async fn disconnect_gatt(&self, handle: GattHandle) -> Result<(), BleError>;

    fn is_connected(&self, handle: GattHandle) -> bool;
}

/// Pick the BLE backend for this process.
pub fn resolve_platform(settings: &BluetoothSettings) -> Result<Arc<dyn BlePlatform>, BleError> {
    let platform: Arc<dyn BlePlatform> = match settings.backend {
        BackendKind::Simulated => Arc::new(memory::MemoryPlatform::new()),
        BackendKind::Native => native_platform()?,
    };
    info!("Selected Bluetooth implementation: {}", platform.name());
    Ok(platform)
}

#[cfg(windows)]
fn native_platform() -> Result<Arc<dyn BlePlatform>, BleError> {
    Ok(Arc::new(winrt::WinRtPlatform::new()))
}

#[cfg(not(windows))]
fn native_platform() -> Result<Arc<dyn BlePlatform>, BleError> {
    Err(BleError::PlatformUnsupported {
        os: std::env::consts::OS.to_string(),
    })
}
