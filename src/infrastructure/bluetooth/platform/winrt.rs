//! WinRT backend built on `Windows.Devices.Bluetooth`.

use super::{
    BlePlatform, CharacteristicInfo, CharacteristicProperties, DisconnectCallback, GattHandle,
    NotificationCallback, RawAdvertisement,
};
use crate::domain::gatt::{CharacteristicId, ServiceId};
use crate::domain::models::DeviceId;
use crate::error::BleError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementType,
    BluetoothLEAdvertisementWatcher, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, IBuffer};

impl From<windows::core::Error> for BleError {
    fn from(e: windows::core::Error) -> Self {
        BleError::Gatt(format!("{} ({:?})", e.message(), e.code()))
    }
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

struct Subscribed {
    characteristic: GattCharacteristic,
    token: i64,
}

struct Session {
    device: BluetoothLEDevice,
    status_token: i64,
    services: HashMap<ServiceId, GattDeviceService>,
    characteristics: HashMap<CharacteristicId, GattCharacteristic>,
    subscriptions: HashMap<CharacteristicId, Subscribed>,
}

#[derive(Default)]
pub struct WinRtPlatform {
    watcher: Mutex<Option<(BluetoothLEAdvertisementWatcher, i64)>>,
    sessions: Mutex<HashMap<GattHandle, Session>>,
    next_handle: AtomicU64,
}

impl WinRtPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<GattHandle, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, handle: GattHandle) -> Result<BluetoothLEDevice, BleError> {
        self.sessions()
            .get(&handle)
            .map(|s| s.device.clone())
            .ok_or(BleError::Disconnected)
    }

    fn characteristic(
        &self,
        handle: GattHandle,
        id: CharacteristicId,
    ) -> Result<GattCharacteristic, BleError> {
        let sessions = self.sessions();
        let session = sessions.get(&handle).ok_or(BleError::Disconnected)?;
        session
            .characteristics
            .get(&id)
            .cloned()
            .ok_or_else(|| BleError::CharacteristicNotFound(id.to_string()))
    }

    fn close_session(session: Session) {
        for (_, sub) in session.subscriptions {
            let _ = sub.characteristic.RemoveValueChanged(sub.token);
        }
        let _ = session
            .device
            .RemoveConnectionStatusChanged(session.status_token);
        for (_, service) in session.services {
            let _ = service.Close();
        }
        let _ = session.device.Close();
    }
}

#[async_trait]
impl BlePlatform for WinRtPlatform {
    fn name(&self) -> &'static str {
        "winrt"
    }

    async fn scan_advertisements(
        &self,
        _filter: &[ServiceId],
    ) -> Result<mpsc::UnboundedReceiver<RawAdvertisement>, BleError> {
        self.stop_scan().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let uuids = adv.ServiceUuids()?;
                    let mut service_ids = Vec::with_capacity(uuids.Size()? as usize);
                    for i in 0..uuids.Size()? {
                        service_ids.push(ServiceId::from_uuid(to_uuid(uuids.GetAt(i)?)));
                    }
                    let name = adv.LocalName()?.to_string();
                    let connectable = matches!(
                        args.AdvertisementType()?,
                        BluetoothLEAdvertisementType::ConnectableUndirected
                            | BluetoothLEAdvertisementType::ConnectableDirected
                            | BluetoothLEAdvertisementType::ScanResponse
                    );

                    let _ = tx.send(RawAdvertisement {
                        address: DeviceId(args.BluetoothAddress()?),
                        local_name: (!name.is_empty()).then_some(name),
                        service_ids,
                        rssi: args.RawSignalStrengthInDBm()?,
                        connectable,
                    });
                }
                Ok(())
            },
        );

        let token = watcher.Received(&handler)?;
        watcher.Start()?;
        info!("BLE advertisement watcher started");
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some((watcher, token));
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        let current = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((watcher, token)) = current {
            info!("Stopping BLE advertisement watcher");
            let _ = watcher.RemoveReceived(token);
            watcher.Stop()?;
        }
        Ok(())
    }

    async fn connect_gatt(
        &self,
        address: DeviceId,
        timeout: Duration,
        on_disconnect: DisconnectCallback,
    ) -> Result<GattHandle, BleError> {
        info!("Connecting to Bluetooth device: {}", address);
        let pending = BluetoothLEDevice::FromBluetoothAddressAsync(address.0)?;
        let device = tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| BleError::ConnectionTimeout)?
            .map_err(|e| BleError::ConnectionRefused(e.message().to_string()))?;

        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        on_disconnect();
                    }
                }
                Ok(())
            });
        let status_token = device.ConnectionStatusChanged(&status_handler)?;

        let handle = GattHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.sessions().insert(
            handle,
            Session {
                device,
                status_token,
                services: HashMap::new(),
                characteristics: HashMap::new(),
                subscriptions: HashMap::new(),
            },
        );
        Ok(handle)
    }

    async fn discover_services(&self, handle: GattHandle) -> Result<Vec<ServiceId>, BleError> {
        let device = self.device(handle)?;
        let result = device.GetGattServicesAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Err(BleError::Gatt(format!(
                "Failed to get GATT services: {:?}",
                result.Status()?
            )));
        }

        let services = result.Services()?;
        let mut found = HashMap::new();
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            found.insert(ServiceId::from_uuid(to_uuid(service.Uuid()?)), service);
        }
        debug!("Found {} GATT services", found.len());

        let ids = found.keys().copied().collect();
        if let Some(session) = self.sessions().get_mut(&handle) {
            session.services = found;
        }
        Ok(ids)
    }

    async fn discover_characteristics(
        &self,
        handle: GattHandle,
        service: ServiceId,
    ) -> Result<Vec<CharacteristicInfo>, BleError> {
        let gatt_service = {
            let sessions = self.sessions();
            let session = sessions.get(&handle).ok_or(BleError::Disconnected)?;
            session
                .services
                .get(&service)
                .cloned()
                .ok_or_else(|| BleError::ServiceNotFound(service.to_string()))?
        };

        let result = gatt_service.GetCharacteristicsAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Err(BleError::Gatt(format!(
                "Failed to get characteristics of {}: {:?}",
                service,
                result.Status()?
            )));
        }

        let characteristics = result.Characteristics()?;
        let mut infos = Vec::new();
        let mut resolved = Vec::new();
        for i in 0..characteristics.Size()? {
            let c = characteristics.GetAt(i)?;
            let props = c.CharacteristicProperties()?;
            let has = |flag: GattCharacteristicProperties| (props.0 & flag.0) != 0;
            let id = CharacteristicId::from_uuid(to_uuid(c.Uuid()?));
            infos.push(CharacteristicInfo {
                id,
                properties: CharacteristicProperties {
                    read: has(GattCharacteristicProperties::Read),
                    notify: has(GattCharacteristicProperties::Notify),
                    indicate: has(GattCharacteristicProperties::Indicate),
                },
            });
            resolved.push((id, c));
        }

        if let Some(session) = self.sessions().get_mut(&handle) {
            session.characteristics.extend(resolved);
        }
        Ok(infos)
    }

    async fn subscribe(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
        on_data: NotificationCallback,
    ) -> Result<(), BleError> {
        let gatt_char = self.characteristic(handle, characteristic)?;
        let props = gatt_char.CharacteristicProperties()?;
        let cccd = if (props.0 & GattCharacteristicProperties::Notify.0) != 0 {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::Indicate
        };

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = buffer_bytes(&args.CharacteristicValue()?)?;
                    on_data(&bytes);
                }
                Ok(())
            },
        );
        let token = gatt_char.ValueChanged(&handler)?;

        let status = gatt_char
            .WriteClientCharacteristicConfigurationDescriptorAsync(cccd)?
            .await?;
        if status != GattCommunicationStatus::Success {
            let _ = gatt_char.RemoveValueChanged(token);
            return Err(BleError::SubscriptionFailed(format!(
                "{}: CCCD write returned {:?}",
                characteristic, status
            )));
        }

        if let Some(session) = self.sessions().get_mut(&handle) {
            session.subscriptions.insert(
                characteristic,
                Subscribed {
                    characteristic: gatt_char,
                    token,
                },
            );
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
    ) -> Result<(), BleError> {
        let removed = self
            .sessions()
            .get_mut(&handle)
            .and_then(|s| s.subscriptions.remove(&characteristic));
        if let Some(sub) = removed {
            let _ = sub.characteristic.RemoveValueChanged(sub.token);
            let status = sub
                .characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::None,
                )?
                .await?;
            if status != GattCommunicationStatus::Success {
                warn!("Clearing CCCD on {} returned {:?}", characteristic, status);
            }
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: GattHandle,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, BleError> {
        let gatt_char = self.characteristic(handle, characteristic)?;
        let result = gatt_char.ReadValueAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Err(BleError::Gatt(format!(
                "Read of {} failed: {:?}",
                characteristic,
                result.Status()?
            )));
        }
        Ok(buffer_bytes(&result.Value()?)?)
    }

    async fn disconnect_gatt(&self, handle: GattHandle) -> Result<(), BleError> {
        if let Some(session) = self.sessions().remove(&handle) {
            Self::close_session(session);
            info!("Closed GATT session {:?}", handle);
        }
        Ok(())
    }

    fn is_connected(&self, handle: GattHandle) -> bool {
        self.sessions()
            .get(&handle)
            .and_then(|s| s.device.ConnectionStatus().ok())
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }
}
