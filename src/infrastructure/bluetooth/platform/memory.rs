//! In-process BLE backend
//!
//! Peripherals are scripted up front (advertisement, GATT table, readable
//! values) and notification frames are injected by the caller. With no
//! peripherals registered it behaves like an empty room, which is what the
//! `simulated` backend setting uses to drive the synthetic data fallback.

use super::{
    BlePlatform, CharacteristicInfo, CharacteristicProperties, DisconnectCallback, GattHandle,
    NotificationCallback, RawAdvertisement,
};
use crate::domain::gatt::{CharacteristicId, ServiceId};
use crate::domain::models::DeviceId;
use crate::error::BleError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub advertisement: RawAdvertisement,
    pub services: Vec<(ServiceId, Vec<CharacteristicInfo>)>,
    pub values: HashMap<CharacteristicId, Vec<u8>>,
    /// Frames pushed the moment a characteristic is subscribed.
    pub frames_on_subscribe: HashMap<CharacteristicId, Vec<u8>>,
    /// Advertisement reports delivered per scan.
    pub advertisement_repeats: usize,
    pub refuse_connection: bool,
    pub connect_delay: Duration,
    pub unsubscribe_delay: Duration,
}

impl MockPeripheral {
    pub fn new(address: DeviceId, name: &str) -> Self {
        Self {
            advertisement: RawAdvertisement {
                address,
                local_name: (!name.is_empty()).then(|| name.to_string()),
                service_ids: Vec::new(),
                rssi: -60,
                connectable: true,
            },
            services: Vec::new(),
            values: HashMap::new(),
            frames_on_subscribe: HashMap::new(),
            advertisement_repeats: 1,
            refuse_connection: false,
            connect_delay: Duration::ZERO,
            unsubscribe_delay: Duration::ZERO,
        }
    }

    /// FTMS indoor trainer with Device Information.
    pub fn trainer(address: DeviceId, name: &str) -> Self {
        Self::new(address, name)
            .advertising(ServiceId::FITNESS_MACHINE)
            .with_service(
                ServiceId::FITNESS_MACHINE,
                vec![
                    notify_characteristic(CharacteristicId::INDOOR_BIKE_DATA),
                    read_characteristic(CharacteristicId::FITNESS_MACHINE_FEATURE),
                ],
            )
            .with_value(
                CharacteristicId::FITNESS_MACHINE_FEATURE,
                vec![0x82, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            )
            .with_device_information("Wahoo Fitness", name, "WF-123456", "4.2.1")
    }

    /// Heart-rate strap.
    pub fn heart_rate_strap(address: DeviceId, name: &str) -> Self {
        Self::new(address, name)
            .advertising(ServiceId::HEART_RATE)
            .with_service(
                ServiceId::HEART_RATE,
                vec![notify_characteristic(
                    CharacteristicId::HEART_RATE_MEASUREMENT,
                )],
            )
    }

    pub fn advertising(mut self, service: ServiceId) -> Self {
        self.advertisement.service_ids.push(service);
        self
    }

    pub fn with_service(mut self, service: ServiceId, characteristics: Vec<CharacteristicInfo>) -> Self {
        self.services.push((service, characteristics));
        self
    }

    pub fn with_value(mut self, characteristic: CharacteristicId, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    pub fn with_device_information(
        self,
        manufacturer: &str,
        model: &str,
        serial: &str,
        firmware: &str,
    ) -> Self {
        self.with_service(
            ServiceId::DEVICE_INFORMATION,
            vec![
                read_characteristic(CharacteristicId::MANUFACTURER_NAME),
                read_characteristic(CharacteristicId::MODEL_NUMBER),
                read_characteristic(CharacteristicId::SERIAL_NUMBER),
                read_characteristic(CharacteristicId::FIRMWARE_REVISION),
            ],
        )
        .with_value(CharacteristicId::MANUFACTURER_NAME, manufacturer.as_bytes().to_vec())
        .with_value(CharacteristicId::MODEL_NUMBER, model.as_bytes().to_vec())
        .with_value(CharacteristicId::SERIAL_NUMBER, serial.as_bytes().to_vec())
        .with_value(CharacteristicId::FIRMWARE_REVISION, firmware.as_bytes().to_vec())
    }

    /// Notify `frame` as soon as `characteristic` is subscribed, as trainers
    /// that stream immediately after the CCCD write do.
    pub fn with_frame_on_subscribe(mut self, characteristic: CharacteristicId, frame: Vec<u8>) -> Self {
        self.frames_on_subscribe.insert(characteristic, frame);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.advertisement.rssi = rssi;
        self
    }

    pub fn with_advertisement_repeats(mut self, repeats: usize) -> Self {
        self.advertisement_repeats = repeats;
        self
    }

    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connection = true;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_unsubscribe_delay(mut self, delay: Duration) -> Self {
        self.unsubscribe_delay = delay;
        self
    }

    fn characteristic(&self, id: CharacteristicId) -> Option<CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|(_, chars)| chars.iter())
            .find(|c| c.id == id)
            .copied()
    }
}

pub fn notify_characteristic(id: CharacteristicId) -> CharacteristicInfo {
    CharacteristicInfo {
        id,
        properties: CharacteristicProperties {
            read: false,
            notify: true,
            indicate: false,
        },
    }
}

pub fn read_characteristic(id: CharacteristicId) -> CharacteristicInfo {
    CharacteristicInfo {
        id,
        properties: CharacteristicProperties {
            read: true,
            notify: false,
            indicate: false,
        },
    }
}

struct Session {
    address: DeviceId,
    connected: bool,
    subscriptions: HashMap<CharacteristicId, NotificationCallback>,
    on_disconnect: DisconnectCallback,
}

#[derive(Default)]
struct MemoryState {
    peripherals: BTreeMap<DeviceId, MockPeripheral>,
    sessions: HashMap<GattHandle, Session>,
    scan_tx: Option<mpsc::UnboundedSender<RawAdvertisement>>,
}

#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<MemoryState>,
    next_handle: AtomicU64,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
    gatt_disconnects: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peripherals(peripherals: impl IntoIterator<Item = MockPeripheral>) -> Self {
        let platform = Self::new();
        for peripheral in peripherals {
            platform.add_peripheral(peripheral);
        }
        platform
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.lock()
            .peripherals
            .insert(peripheral.advertisement.address, peripheral);
    }

    pub fn remove_peripheral(&self, address: DeviceId) -> Option<MockPeripheral> {
        self.lock().peripherals.remove(&address)
    }

    /// Push an extra advertisement report into the running scan.
    pub fn advertise(&self, advertisement: RawAdvertisement) -> bool {
        match &self.lock().scan_tx {
            Some(tx) => tx.send(advertisement).is_ok(),
            None => false,
        }
    }

    /// Deliver a notification frame to every subscriber of `characteristic`
    /// on `address`. Returns the number of callbacks invoked.
    pub fn notify(&self, address: DeviceId, characteristic: CharacteristicId, bytes: &[u8]) -> usize {
        let callbacks: Vec<NotificationCallback> = self
            .lock()
            .sessions
            .values()
            .filter(|s| s.address == address && s.connected)
            .filter_map(|s| s.subscriptions.get(&characteristic).cloned())
            .collect();
        for callback in &callbacks {
            callback(bytes);
        }
        callbacks.len()
    }

    /// Lose the link silently, as stacks that never report disconnects do.
    pub fn drop_link(&self, address: DeviceId) {
        for session in self.lock().sessions.values_mut() {
            if session.address == address {
                session.connected = false;
            }
        }
    }

    /// Lose the link and fire the native disconnect callback.
    pub fn fire_disconnect(&self, address: DeviceId) {
        let callbacks: Vec<DisconnectCallback> = self
            .lock()
            .sessions
            .values_mut()
            .filter(|s| s.address == address && s.connected)
            .map(|s| {
                s.connected = false;
                s.on_disconnect.clone()
            })
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_tx.is_some()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scan_stops(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }

    pub fn gatt_disconnects(&self) -> usize {
        self.gatt_disconnects.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    fn peripheral_for(&self, handle: GattHandle) -> Result<MockPeripheral, BleError> {
        let state = self.lock();
        let session = state.sessions.get(&handle).ok_or(BleError::Disconnected)?;
        if !session.connected {
            return Err(BleError::Disconnected);
        }
        state
            .peripherals
            .get(&session.address)
            .cloned()
            .ok_or_else(|| BleError::UnknownDevice(session.address.to_string()))
    }
}

#[async_trait]
impl BlePlatform for MemoryPlatform {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn scan_advertisements(
        &self,
        _filter: &[ServiceId],
    ) -> Result<mpsc::UnboundedReceiver<RawAdvertisement>, BleError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for peripheral in state.peripherals.values() {
            for _ in 0..peripheral.advertisement_repeats {
                let _ = tx.send(peripheral.advertisement.clone());
            }
        }
        state.scan_tx = Some(tx);
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        debug!("Memory scan started with {} peripherals", state.peripherals.len());
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.lock().scan_tx = None;
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect_gatt(
        &self,
        address: DeviceId,
        timeout: Duration,
        on_disconnect: DisconnectCallback,
    ) -> Result<GattHandle, BleError> {
        let peripheral = self
            .lock()
            .peripherals
            .get(&address)
            .cloned()
            .ok_or_else(|| BleError::ConnectionRefused(format!("no peripheral at {}", address)))?;

        if peripheral.refuse_connection {
            return Err(BleError::ConnectionRefused(format!(
                "{} refused the connection",
                address
            )));
        }
        if peripheral.connect_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(BleError::ConnectionTimeout);
        }
        if !peripheral.connect_delay.is_zero() {
            tokio::time::sleep(peripheral.connect_delay).await;
        }

        let handle = GattHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().sessions.insert(
            handle,
            Session {
                address,
                connected: true,
                subscriptions: HashMap::new(),
                on_disconnect,
            },
        );
        Ok(handle)
    }

    async fn discover_services(&self, handle: GattHandle) -> Result<Vec<ServiceId>, BleError> {
        let peripheral = self.peripheral_for(handle)?;
        Ok(peripheral.services.iter().map(|(id, _)| *id).collect())
    }

    async fn discover_characteristics(
        &self,
        handle: GattHandle,
        service: ServiceId,
    ) -> Result<Vec<CharacteristicInfo>, BleError> {
        let peripheral = self.peripheral_for(handle)?;
        peripheral
            .services
            .iter()
            .find(|(id, _)| *id == service)
            .map(|(_, chars)| chars.clone())
            .ok_or_else(|| BleError::ServiceNotFound(service.to_string()))
    }

    async fn subscribe(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
        on_data: NotificationCallback,
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral_for(handle)?;
        let info = peripheral
            .characteristic(characteristic)
            .ok_or_else(|| BleError::CharacteristicNotFound(characteristic.to_string()))?;
        if !info.properties.can_subscribe() {
            return Err(BleError::SubscriptionFailed(format!(
                "{} does not support notifications",
                characteristic
            )));
        }
        if let Some(session) = self.lock().sessions.get_mut(&handle) {
            session.subscriptions.insert(characteristic, on_data.clone());
        }
        if let Some(frame) = peripheral.frames_on_subscribe.get(&characteristic) {
            on_data(frame.as_slice());
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
    ) -> Result<(), BleError> {
        let delay = self
            .peripheral_for(handle)
            .map(|p| p.unsubscribe_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(session) = self.lock().sessions.get_mut(&handle) {
            session.subscriptions.remove(&characteristic);
        }
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, BleError> {
        let peripheral = self.peripheral_for(handle)?;
        peripheral
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound(characteristic.to_string()))
    }

    async fn disconnect_gatt(&self, handle: GattHandle) -> Result<(), BleError> {
        if self.lock().sessions.remove(&handle).is_some() {
            self.gatt_disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self, handle: GattHandle) -> bool {
        self.lock()
            .sessions
            .get(&handle)
            .map(|s| s.connected)
            .unwrap_or(false)
    }
}
