//! BLE Connection Module
//!
//! One [`DeviceConnection`] owns the GATT session of one physical device:
//!
//! ```text
//! Discovered -> Connecting -> ServiceDiscovery -> Subscribing -> Active
//!                                                                  |
//!                             Disconnected <- Disconnecting <------+
//! ```
//!
//! `Failed` is reachable from every non-terminal state. Failures never cross
//! the public boundary as errors: `connect` and `start_notifications` report
//! a `bool` and log the cause.

use crate::domain::events::EventHub;
use crate::domain::gatt::{CharacteristicId, ServiceId};
use crate::domain::models::{
    ConnectionRecord, ConnectionState, DeviceDescriptor, DeviceId, DeviceInformation,
    MessageSeverity, TrainerSample,
};
use crate::error::BleError;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, CharacteristicInfo, DisconnectCallback, GattHandle, NotificationCallback,
};
use crate::infrastructure::bluetooth::protocol;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives every decoded frame. Called from the platform's notification
/// context, so it must return quickly.
pub type SampleSink = Arc<dyn Fn(TrainerSample) + Send + Sync>;

/// Discovery order: trainers first, then power/speed sensors, then HR straps.
const SERVICE_PRIORITY: [(ServiceId, u8); 4] = [
    (ServiceId::FITNESS_MACHINE, 0),
    (ServiceId::CYCLING_POWER, 1),
    (ServiceId::CYCLING_SPEED_CADENCE, 1),
    (ServiceId::HEART_RATE, 2),
];

fn priority_of(service: ServiceId) -> Option<u8> {
    SERVICE_PRIORITY
        .iter()
        .find(|(id, _)| *id == service)
        .map(|(_, p)| *p)
}

/// Notification characteristic this crate decodes for a service.
fn data_characteristic_for(service: ServiceId) -> Option<CharacteristicId> {
    match service {
        s if s == ServiceId::FITNESS_MACHINE => Some(CharacteristicId::INDOOR_BIKE_DATA),
        s if s == ServiceId::CYCLING_POWER => Some(CharacteristicId::CYCLING_POWER_MEASUREMENT),
        s if s == ServiceId::HEART_RATE => Some(CharacteristicId::HEART_RATE_MEASUREMENT),
        _ => None,
    }
}

pub struct DeviceConnection {
    descriptor: DeviceDescriptor,
    platform: Arc<dyn BlePlatform>,
    events: Arc<EventHub>,
    on_disconnect: DisconnectCallback,
    state: ConnectionState,
    handle: Option<GattHandle>,
    data_sources: Vec<CharacteristicInfo>,
    subscribed: BTreeSet<CharacteristicId>,
    device_info: Option<DeviceInformation>,
    dropped_frames: Arc<AtomicU64>,
}

impl DeviceConnection {
    /// `on_disconnect` is handed to the native stack and fires when it
    /// notices the link is gone.
    pub fn new(
        descriptor: DeviceDescriptor,
        platform: Arc<dyn BlePlatform>,
        events: Arc<EventHub>,
        on_disconnect: DisconnectCallback,
    ) -> Self {
        Self {
            descriptor,
            platform,
            events,
            on_disconnect,
            state: ConnectionState::Discovered,
            handle: None,
            data_sources: Vec::new(),
            subscribed: BTreeSet::new(),
            device_info: None,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Address of the device
    pub fn id(&self) -> DeviceId {
        self.descriptor.id
    }

    /// Advertised name, `"Unknown"` when the device sent none
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Device Information read during `connect`, if the device has any
    pub fn device_info(&self) -> Option<&DeviceInformation> {
        self.device_info.as_ref()
    }

    /// Frames that failed to decode since the connection was created
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn record(&self) -> ConnectionRecord {
        ConnectionRecord {
            descriptor: self.descriptor.clone(),
            state: self.state,
            subscribed_characteristics: self.subscribed.clone(),
            device_info: self.device_info.clone(),
            dropped_frames: self.dropped_frames(),
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("{} ({}): {:?} -> {:?}", self.descriptor.name, self.descriptor.id, self.state, next);
            self.state = next;
        }
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.events.send_log(message, severity);
    }

    /// Open the GATT session and discover what the device offers.
    pub async fn connect(&mut self, timeout: Duration) -> bool {
        if self.state != ConnectionState::Discovered && !self.state.is_terminal() {
            warn!("connect() on {} ignored in state {:?}", self.descriptor.name, self.state);
            return self.state == ConnectionState::Active;
        }

        info!("Connecting to {} ({})", self.descriptor.name, self.descriptor.id);
        self.send_log(
            format!("Connecting to {}...", self.descriptor.name),
            MessageSeverity::Info,
        );
        self.set_state(ConnectionState::Connecting);

        let attempt = self
            .platform
            .connect_gatt(self.descriptor.id, timeout, self.on_disconnect.clone());
        let handle = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return self.fail(e).await,
            Err(_) => return self.fail(BleError::ConnectionTimeout).await,
        };
        self.handle = Some(handle);

        self.set_state(ConnectionState::ServiceDiscovery);
        match self.discover(handle).await {
            Ok(()) => {
                info!(
                    "Connected to {}: {} data source(s)",
                    self.descriptor.name,
                    self.data_sources.len()
                );
                true
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn fail(&mut self, e: BleError) -> bool {
        warn!("Connection to {} failed: {}", self.descriptor.name, e);
        self.send_log(
            format!("Failed to connect to {}: {}", self.descriptor.name, e),
            MessageSeverity::Error,
        );
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.platform.disconnect_gatt(handle).await {
                debug!("Releasing half-open session failed: {}", e);
            }
        }
        self.data_sources.clear();
        self.set_state(ConnectionState::Failed);
        false
    }

    async fn discover(&mut self, handle: GattHandle) -> Result<(), BleError> {
        let offered = self.platform.discover_services(handle).await?;
        debug!("{} offers {} services", self.descriptor.name, offered.len());

        let mut ranked: Vec<(u8, ServiceId)> = offered
            .iter()
            .filter_map(|s| priority_of(*s).map(|p| (p, *s)))
            .collect();
        ranked.sort_by_key(|(p, _)| *p);

        let mut has_feature_char = false;
        for (_, service) in ranked {
            let characteristics = match self.platform.discover_characteristics(handle, service).await {
                Ok(chars) => chars,
                Err(e) => {
                    debug!("Skipping {}: {}", service, e);
                    continue;
                }
            };
            has_feature_char |= characteristics
                .iter()
                .any(|c| c.id == CharacteristicId::FITNESS_MACHINE_FEATURE);

            let Some(wanted) = data_characteristic_for(service) else {
                debug!("No decoder for {}, skipping", service);
                continue;
            };
            // Indoor Bike Data already carries power.
            if wanted == CharacteristicId::CYCLING_POWER_MEASUREMENT
                && self.has_source(CharacteristicId::INDOOR_BIKE_DATA)
            {
                continue;
            }
            match characteristics.into_iter().find(|c| c.id == wanted) {
                Some(info) => self.data_sources.push(info),
                None => debug!(
                    "{}",
                    BleError::CharacteristicNotFound(format!("{} in {}", wanted, service))
                ),
            }
        }

        let has_dis = offered.contains(&ServiceId::DEVICE_INFORMATION);
        if has_dis || has_feature_char {
            self.device_info = Some(
                self.read_device_information(handle, has_dis, has_feature_char)
                    .await,
            );
        }
        Ok(())
    }

    fn has_source(&self, id: CharacteristicId) -> bool {
        self.data_sources.iter().any(|c| c.id == id)
    }

    async fn read_device_information(
        &self,
        handle: GattHandle,
        has_dis: bool,
        has_features: bool,
    ) -> DeviceInformation {
        let mut info = DeviceInformation::default();
        if has_dis {
            if let Err(e) = self
                .platform
                .discover_characteristics(handle, ServiceId::DEVICE_INFORMATION)
                .await
            {
                debug!("Device Information discovery failed: {}", e);
            }
            info.manufacturer_name = self.read_string(handle, CharacteristicId::MANUFACTURER_NAME).await;
            info.model_number = self.read_string(handle, CharacteristicId::MODEL_NUMBER).await;
            info.serial_number = self.read_string(handle, CharacteristicId::SERIAL_NUMBER).await;
            info.firmware_revision = self.read_string(handle, CharacteristicId::FIRMWARE_REVISION).await;
        } else {
            info.manufacturer_name = "Unknown".to_string();
            info.model_number = "Unknown".to_string();
            info.serial_number = "Unknown".to_string();
            info.firmware_revision = "Unknown".to_string();
        }

        if has_features {
            match self
                .platform
                .read_characteristic(handle, CharacteristicId::FITNESS_MACHINE_FEATURE)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    protocol::decode_fitness_machine_features(&bytes).map_err(|e| e.to_string())
                }) {
                Ok(features) => info.supported_features = features,
                Err(e) => debug!("Fitness Machine Feature read failed: {}", e),
            }
        }

        info!(
            "{}: {} {} (serial {}, firmware {}, features {:#010x})",
            self.descriptor.name,
            info.manufacturer_name,
            info.model_number,
            info.serial_number,
            info.firmware_revision,
            info.supported_features
        );
        info
    }

    async fn read_string(&self, handle: GattHandle, id: CharacteristicId) -> String {
        match self.platform.read_characteristic(handle, id).await {
            Ok(bytes) => {
                let value = protocol::decode_utf8_string(&bytes);
                if value.is_empty() {
                    "Unknown".to_string()
                } else {
                    value
                }
            }
            Err(e) => {
                debug!("Reading {} failed: {}", id, e);
                "Unknown".to_string()
            }
        }
    }

    /// Subscribe to every data characteristic found during discovery.
    ///
    /// Returns `false` when nothing could be subscribed. The connection is
    /// `Active` either way.
    pub async fn start_notifications(&mut self, sink: SampleSink) -> bool {
        let Some(handle) = self.handle else {
            warn!("start_notifications() on {} without a session", self.descriptor.name);
            return false;
        };
        if self.state != ConnectionState::ServiceDiscovery {
            return !self.subscribed.is_empty();
        }

        self.set_state(ConnectionState::Subscribing);
        for source in self.data_sources.clone() {
            if !source.properties.can_subscribe() {
                warn!(
                    "{}",
                    BleError::SubscriptionFailed(format!(
                        "{} on {} lacks the notify property",
                        source.id, self.descriptor.name
                    ))
                );
                continue;
            }

            let callback = self.frame_handler(source.id, sink.clone());
            match self.platform.subscribe(handle, source.id, callback).await {
                Ok(()) => {
                    info!("Subscribed to {} on {}", source.id, self.descriptor.name);
                    self.subscribed.insert(source.id);
                }
                Err(e) => warn!("Subscribing to {} on {} failed: {}", source.id, self.descriptor.name, e),
            }
        }
        self.set_state(ConnectionState::Active);

        if self.subscribed.is_empty() {
            self.send_log(
                format!("Connected to {} (no data available)", self.descriptor.name),
                MessageSeverity::Warning,
            );
            false
        } else {
            self.send_log(
                format!("Connected to {}", self.descriptor.name),
                MessageSeverity::Success,
            );
            true
        }
    }

    /// Decode-and-forward callback for one characteristic. Nothing escapes
    /// into the native stack: parse errors are counted, panics are caught.
    fn frame_handler(&self, characteristic: CharacteristicId, sink: SampleSink) -> NotificationCallback {
        let dropped = self.dropped_frames.clone();
        let device = self.descriptor.name.clone();
        Arc::new(move |bytes: &[u8]| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                match protocol::decode_notification(characteristic, bytes) {
                    Ok(Some(sample)) => sink(sample),
                    Ok(None) => {}
                    Err(e) => {
                        let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("Dropped {} frame from {} ({} total): {}", characteristic, device, total, e);
                    }
                }
            }));
            if outcome.is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
                error!("Panic while handling {} frame from {}", characteristic, device);
            }
        })
    }

    /// Whether the native link is still up.
    pub fn is_connected(&self) -> bool {
        self.handle
            .map(|h| self.platform.is_connected(h))
            .unwrap_or(false)
    }

    /// Unsubscribe (bounded by `grace`) and release the session. A second call is a no-op.
    pub async fn disconnect(&mut self, grace: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        info!("Disconnecting from {}", self.descriptor.name);
        self.set_state(ConnectionState::Disconnecting);

        let subscribed = std::mem::take(&mut self.subscribed);
        let platform = self.platform.clone();
        let unsubscribe_all = async {
            for characteristic in &subscribed {
                if let Err(e) = platform.unsubscribe(handle, *characteristic).await {
                    warn!("Unsubscribing from {} failed: {}", characteristic, e);
                }
            }
        };
        if tokio::time::timeout(grace, unsubscribe_all).await.is_err() {
            warn!(
                "Unsubscribe from {} did not finish within {:?}, releasing anyway",
                self.descriptor.name, grace
            );
        }

        if let Err(e) = self.platform.disconnect_gatt(handle).await {
            warn!("Releasing GATT session of {} failed: {}", self.descriptor.name, e);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::platform::memory::{
        notify_characteristic, read_characteristic, MemoryPlatform, MockPeripheral,
    };
    use crate::infrastructure::bluetooth::scanner::descriptor_from;
    use std::sync::Mutex;

    const TRAINER: DeviceId = DeviceId(0xC0FFEE);

    fn connection_to(platform: &Arc<MemoryPlatform>, peripheral: &MockPeripheral) -> DeviceConnection {
        DeviceConnection::new(
            descriptor_from(peripheral.advertisement.clone()),
            platform.clone(),
            Arc::new(EventHub::default()),
            Arc::new(|| {}),
        )
    }

    fn collecting_sink() -> (SampleSink, Arc<Mutex<Vec<TrainerSample>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let store = samples.clone();
        (Arc::new(move |s: TrainerSample| store.lock().unwrap().push(s)), samples)
    }

    #[tokio::test]
    async fn test_connect_reads_device_information() {
        let trainer = MockPeripheral::trainer(TRAINER, "KICKR CORE");
        let platform = Arc::new(MemoryPlatform::with_peripherals([trainer.clone()]));
        let mut connection = connection_to(&platform, &trainer);

        assert!(connection.connect(Duration::from_secs(5)).await);
        assert_eq!(connection.state(), ConnectionState::ServiceDiscovery);

        let info = connection.device_info().unwrap();
        assert_eq!(info.manufacturer_name, "Wahoo Fitness");
        assert_eq!(info.firmware_revision, "4.2.1");
        assert!(info.supports_feature(protocol::machine_features::POWER_MEASUREMENT));
        assert!(info.supports_feature(protocol::machine_features::CADENCE));
    }

    #[tokio::test]
    async fn test_notifications_decode_and_forward() {
        let trainer = MockPeripheral::trainer(TRAINER, "KICKR CORE");
        let platform = Arc::new(MemoryPlatform::with_peripherals([trainer.clone()]));
        let mut connection = connection_to(&platform, &trainer);
        let (sink, samples) = collecting_sink();

        assert!(connection.connect(Duration::from_secs(5)).await);
        assert!(connection.start_notifications(sink).await);
        assert_eq!(connection.state(), ConnectionState::Active);

        // flags: cadence + power; speed 25.00 km/h, cadence 90 rpm, power 200 W
        platform.notify(
            TRAINER,
            CharacteristicId::INDOOR_BIKE_DATA,
            &[0x44, 0x00, 0xC4, 0x09, 0xB4, 0x00, 0xC8, 0x00],
        );

        {
            let samples = samples.lock().unwrap();
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].power(), Some(200));
            assert_eq!(samples[0].cadence(), Some(90.0));
            assert_eq!(samples[0].speed(), Some(25.0));
        }

        connection.disconnect(Duration::from_secs(2)).await;
        assert_eq!(platform.unsubscribes(), 1);
        assert_eq!(
            platform.notify(TRAINER, CharacteristicId::INDOOR_BIKE_DATA, &[0x00, 0x00, 0x10, 0x00]),
            0
        );
        assert_eq!(samples.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_counted_not_fatal() {
        let strap = MockPeripheral::heart_rate_strap(TRAINER, "Polar H10");
        let platform = Arc::new(MemoryPlatform::with_peripherals([strap.clone()]));
        let mut connection = connection_to(&platform, &strap);
        let (sink, samples) = collecting_sink();

        assert!(connection.connect(Duration::from_secs(5)).await);
        assert!(connection.start_notifications(sink).await);

        platform.notify(TRAINER, CharacteristicId::HEART_RATE_MEASUREMENT, &[0x00]);
        platform.notify(TRAINER, CharacteristicId::HEART_RATE_MEASUREMENT, &[0x00, 0x48]);

        assert_eq!(connection.dropped_frames(), 1);
        assert!(connection.is_connected());
        assert_eq!(samples.lock().unwrap()[0].heart_rate(), Some(72));
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let trainer = MockPeripheral::trainer(TRAINER, "KICKR CORE").refusing_connections();
        let platform = Arc::new(MemoryPlatform::with_peripherals([trainer.clone()]));
        let mut connection = connection_to(&platform, &trainer);

        assert!(!connection.connect(Duration::from_secs(5)).await);
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(platform.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connection_times_out() {
        let trainer = MockPeripheral::trainer(TRAINER, "KICKR CORE")
            .with_connect_delay(Duration::from_secs(30));
        let platform = Arc::new(MemoryPlatform::with_peripherals([trainer.clone()]));
        let mut connection = connection_to(&platform, &trainer);

        assert!(!connection.connect(Duration::from_secs(10)).await);
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_read_only_characteristic_stays_active_without_data() {
        let device = MockPeripheral::new(TRAINER, "Odd HRM")
            .advertising(ServiceId::HEART_RATE)
            .with_service(
                ServiceId::HEART_RATE,
                vec![read_characteristic(CharacteristicId::HEART_RATE_MEASUREMENT)],
            );
        let platform = Arc::new(MemoryPlatform::with_peripherals([device.clone()]));
        let mut connection = connection_to(&platform, &device);
        let (sink, _) = collecting_sink();

        assert!(connection.connect(Duration::from_secs(5)).await);
        assert!(!connection.start_notifications(sink).await);
        assert_eq!(connection.state(), ConnectionState::Active);
        assert!(connection.record().subscribed_characteristics.is_empty());
    }

    #[tokio::test]
    async fn test_trainer_data_preferred_over_power_service() {
        let device = MockPeripheral::trainer(TRAINER, "KICKR CORE")
            .advertising(ServiceId::CYCLING_POWER)
            .with_service(
                ServiceId::CYCLING_POWER,
                vec![notify_characteristic(CharacteristicId::CYCLING_POWER_MEASUREMENT)],
            );
        let platform = Arc::new(MemoryPlatform::with_peripherals([device.clone()]));
        let mut connection = connection_to(&platform, &device);
        let (sink, _) = collecting_sink();

        assert!(connection.connect(Duration::from_secs(5)).await);
        assert!(connection.start_notifications(sink).await);

        let subscribed = connection.record().subscribed_characteristics;
        assert!(subscribed.contains(&CharacteristicId::INDOOR_BIKE_DATA));
        assert!(!subscribed.contains(&CharacteristicId::CYCLING_POWER_MEASUREMENT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_bounded() {
        let trainer = MockPeripheral::trainer(TRAINER, "KICKR CORE")
            .with_unsubscribe_delay(Duration::from_secs(60));
        let platform = Arc::new(MemoryPlatform::with_peripherals([trainer.clone()]));
        let mut connection = connection_to(&platform, &trainer);
        let (sink, _) = collecting_sink();

        assert!(connection.connect(Duration::from_secs(5)).await);
        assert!(connection.start_notifications(sink).await);

        let started = tokio::time::Instant::now();
        connection.disconnect(Duration::from_secs(2)).await;
        assert!(started.elapsed() <= Duration::from_secs(3));
        connection.disconnect(Duration::from_secs(2)).await;

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(platform.gatt_disconnects(), 1);
        assert_eq!(platform.open_sessions(), 0);
    }
}
