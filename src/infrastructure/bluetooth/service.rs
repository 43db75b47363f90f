//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connections, metric merging and
//! the simulation fallback. It is the public API the overlay talks to.

use crate::domain::events::EventHub;
use crate::domain::gatt::ServiceId;
use crate::domain::metrics::MetricsStore;
use crate::domain::models::{
    ConnectionRecord, ConnectionStatus, CyclingMetrics, DeviceDescriptor, DeviceId,
    DeviceInformation, MessageSeverity, StatusMessage, TrainerSample,
};
use crate::domain::settings::BluetoothSettings;
use crate::error::BleError;
use crate::infrastructure::bluetooth::connection::{DeviceConnection, SampleSink};
use crate::infrastructure::bluetooth::platform::{BlePlatform, DisconnectCallback};
use crate::infrastructure::bluetooth::scanner::DeviceScanner;
use crate::infrastructure::bluetooth::simulation::{
    simulated_device_information, SimulationGenerator, SIMULATED_DEVICE_NAME,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Main Bluetooth service coordinating all BLE operations.
///
/// Cheap to clone; all clones share the same state. Must be created inside
/// a Tokio runtime, since it spawns the liveness and disconnect watchers.
#[derive(Clone)]
pub struct BluetoothService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    platform: Arc<dyn BlePlatform>,
    settings: BluetoothSettings,
    scanner: DeviceScanner,
    connections: Mutex<HashMap<DeviceId, DeviceConnection>>,
    known_devices: StdMutex<HashMap<DeviceId, DeviceDescriptor>>,
    connecting: StdMutex<HashSet<DeviceId>>,
    /// Bumped by every `disconnect_all`; connects that started earlier are discarded.
    disposal_epoch: AtomicU64,
    metrics: Arc<MetricsStore>,
    events: Arc<EventHub>,
    simulator: SimulationGenerator,
    last_status: StdMutex<ConnectionStatus>,
    lost_tx: mpsc::UnboundedSender<DeviceId>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl BluetoothService {
    pub fn new(platform: Arc<dyn BlePlatform>, settings: BluetoothSettings) -> Self {
        let events = Arc::new(EventHub::default());
        let metrics = Arc::new(MetricsStore::new(events.clone()));
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ServiceInner {
            scanner: DeviceScanner::new(platform.clone(), events.clone()),
            simulator: SimulationGenerator::new(metrics.clone(), settings.simulation_tick()),
            platform,
            settings,
            connections: Mutex::new(HashMap::new()),
            known_devices: StdMutex::new(HashMap::new()),
            connecting: StdMutex::new(HashSet::new()),
            disposal_epoch: AtomicU64::new(0),
            metrics,
            events,
            last_status: StdMutex::new(ConnectionStatus::disconnected()),
            lost_tx,
            background: StdMutex::new(Vec::new()),
        });

        let liveness = tokio::spawn(watch_liveness(
            Arc::downgrade(&inner),
            inner.settings.liveness_interval(),
        ));
        let lost = tokio::spawn(watch_lost_devices(Arc::downgrade(&inner), lost_rx));
        inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([liveness, lost]);

        info!(
            "Bluetooth service ready on the {} backend",
            inner.platform.name()
        );
        Self { inner }
    }

    /// Settings the service was created with
    pub fn settings(&self) -> &BluetoothSettings {
        &self.inner.settings
    }

    /// Scan for fitness devices and return everything found.
    pub async fn scan_for_devices(&self, timeout: Duration) -> Vec<DeviceDescriptor> {
        self.inner.scan_for_devices(timeout).await
    }

    /// Stop a running scan
    pub async fn stop_scan(&self) {
        self.inner.scanner.stop_scan().await;
    }

    /// Connect to a device seen in a previous scan (or found by a short
    /// rescan) and start streaming its data.
    pub async fn connect_to_device(&self, id: DeviceId) -> bool {
        self.inner.connect_to_device(id).await
    }

    /// Scan, connect, and fall back to simulation when nothing is usable.
    pub async fn scan_and_connect(&self) -> bool {
        let inner = &self.inner;
        let devices = inner.scan_for_devices(inner.settings.scan_timeout()).await;
        let candidates: Vec<DeviceId> = devices
            .iter()
            .filter(|d| d.connectable)
            .map(|d| d.id)
            .collect();

        let connected = if candidates.is_empty() {
            info!("No fitness devices found");
            false
        } else if inner.settings.connect_all_candidates {
            let mut any = false;
            for id in candidates {
                any |= inner.connect_to_device(id).await;
            }
            any
        } else {
            inner.connect_to_device(candidates[0]).await
        };

        if connected {
            return true;
        }
        if !inner.settings.simulation_fallback {
            inner.events.send_log(
                "No devices connected and simulation fallback is disabled",
                MessageSeverity::Warning,
            );
            return false;
        }
        inner.start_simulation().await
    }

    /// Start the synthetic data source directly.
    pub async fn start_simulation(&self) -> bool {
        self.inner.start_simulation().await
    }

    /// Disconnect one device. Returns `false` if it was not connected.
    pub async fn disconnect_device(&self, id: DeviceId) -> bool {
        self.inner.remove_connection(id, None).await
    }

    /// Tear down every connection and stop the simulator.
    pub async fn disconnect(&self) {
        self.disconnect_all().await;
    }

    /// Disconnect every device, stop the simulator and reset metrics.
    /// Connects still in flight are released instead of registered.
    pub async fn disconnect_all(&self) {
        self.inner.disconnect_all().await;
    }

    /// Latest merged metrics snapshot
    pub fn get_current_metrics(&self) -> CyclingMetrics {
        self.inner.metrics.current()
    }

    /// Last published connection status
    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.inner
            .last_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to merged metrics updates
    pub fn subscribe_metrics(&self) -> broadcast::Receiver<CyclingMetrics> {
        self.inner.events.subscribe_metrics()
    }

    /// Subscribe to connection status changes
    pub fn subscribe_connection_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.events.subscribe_connection_status()
    }

    /// Subscribe to user-facing log messages
    pub fn subscribe_log(&self) -> broadcast::Receiver<StatusMessage> {
        self.inner.events.subscribe_log()
    }

    /// Snapshot of every live connection, sorted by name
    pub async fn connection_records(&self) -> Vec<ConnectionRecord> {
        let connections = self.inner.connections.lock().await;
        let mut records: Vec<ConnectionRecord> = connections.values().map(|c| c.record()).collect();
        records.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        records
    }

    /// Names of connected real devices
    pub async fn connected_device_names(&self) -> Vec<String> {
        self.inner.connections.lock().await.values().map(|c| c.name().to_string()).collect()
    }

    /// Whether the synthetic data source is running
    pub fn is_simulating(&self) -> bool {
        self.inner.simulator.is_running()
    }

    /// Device Information of every live source, keyed by display name.
    pub async fn device_information(&self) -> Vec<(String, DeviceInformation)> {
        let mut infos: Vec<(String, DeviceInformation)> = self
            .inner
            .connections
            .lock()
            .await
            .values()
            .filter_map(|c| c.device_info().map(|info| (c.name().to_string(), info.clone())))
            .collect();
        if self.is_simulating() {
            infos.push((SIMULATED_DEVICE_NAME.to_string(), simulated_device_information()));
        }
        infos
    }
}

impl ServiceInner {
    async fn scan_for_devices(&self, timeout: Duration) -> Vec<DeviceDescriptor> {
        let filter = if self.settings.show_all_devices {
            Vec::new()
        } else {
            ServiceId::FITNESS.to_vec()
        };
        let devices = self.scanner.scan_for(filter, timeout).await;

        // Each scan replaces the previous view of the room.
        *self.known_devices.lock().unwrap_or_else(PoisonError::into_inner) =
            devices.iter().map(|d| (d.id, d.clone())).collect();
        devices
    }

    fn known_device(&self, id: DeviceId) -> Option<DeviceDescriptor> {
        self.known_devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    async fn connect_to_device(&self, id: DeviceId) -> bool {
        if self.connections.lock().await.contains_key(&id) {
            info!("Device {} is already connected", id);
            return true;
        }
        if !self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
        {
            warn!("Connection to {} already in progress", id);
            return false;
        }

        let connected = self.establish(id).await;
        self.connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        connected
    }

    async fn establish(&self, id: DeviceId) -> bool {
        let epoch = self.disposal_epoch.load(Ordering::SeqCst);
        let descriptor = match self.known_device(id) {
            Some(descriptor) => descriptor,
            None => {
                debug!("Device {} not seen yet, rescanning", id);
                self.scan_for_devices(self.settings.rescan_timeout()).await;
                match self.known_device(id) {
                    Some(descriptor) => descriptor,
                    None => {
                        let e = BleError::UnknownDevice(id.to_string());
                        warn!("{}", e);
                        self.events.send_log(format!("Device not found: {}", id), MessageSeverity::Error);
                        return false;
                    }
                }
            }
        };

        let mut connection = DeviceConnection::new(
            descriptor,
            self.platform.clone(),
            self.events.clone(),
            self.disconnect_callback(id),
        );
        if !connection.connect(self.settings.connect_timeout()).await {
            return false;
        }
        // The simulator reset must land before the first real frame.
        if self.simulator.stop().await {
            info!("Real device connected, leaving simulation mode");
        }
        if !connection.start_notifications(self.sample_sink()).await {
            warn!("{} connected without any data source", connection.name());
        }

        let mut connections = self.connections.lock().await;
        let disposed = self.disposal_epoch.load(Ordering::SeqCst) != epoch;
        if disposed || connections.contains_key(&id) {
            self.publish_status_locked(&connections);
            drop(connections);
            if disposed {
                info!("Service disposed while connecting to {}, releasing it", connection.name());
            } else {
                warn!("{} was connected concurrently, releasing duplicate session", connection.name());
            }
            connection.disconnect(self.settings.disconnect_grace()).await;
            return false;
        }
        connections.insert(id, connection);
        self.publish_status_locked(&connections);
        true
    }

    fn sample_sink(&self) -> SampleSink {
        let metrics = self.metrics.clone();
        Arc::new(move |sample: TrainerSample| {
            metrics.apply(&sample);
        })
    }

    fn disconnect_callback(&self, id: DeviceId) -> DisconnectCallback {
        let lost = self.lost_tx.clone();
        Arc::new(move || {
            let _ = lost.send(id);
        })
    }

    async fn start_simulation(&self) -> bool {
        let connections = self.connections.lock().await;
        if self.simulator.start() {
            warn!("Falling back to simulation mode");
            self.events.send_log(
                format!("No devices available, using {}", SIMULATED_DEVICE_NAME),
                MessageSeverity::Warning,
            );
        }
        self.publish_status_locked(&connections);
        true
    }

    /// Drop one connection. `reason` is set for links lost underneath us.
    async fn remove_connection(&self, id: DeviceId, reason: Option<&str>) -> bool {
        let mut connection = {
            let mut connections = self.connections.lock().await;
            let Some(connection) = connections.remove(&id) else {
                return false;
            };
            if connections.is_empty() && !self.simulator.is_running() {
                self.metrics.reset();
            }
            self.publish_status_locked(&connections);
            connection
        };

        match reason {
            Some(reason) => {
                warn!("Lost connection to {} ({})", connection.name(), reason);
                self.events.send_log(
                    format!("{} disconnected", connection.name()),
                    MessageSeverity::Warning,
                );
            }
            None => self.events.send_log(
                format!("Disconnected from {}", connection.name()),
                MessageSeverity::Info,
            ),
        }
        connection.disconnect(self.settings.disconnect_grace()).await;
        true
    }

    async fn disconnect_all(&self) {
        self.scanner.stop_scan().await;

        let mut connections = self.connections.lock().await;
        self.disposal_epoch.fetch_add(1, Ordering::SeqCst);
        let mut teardown = JoinSet::new();
        for (_, mut connection) in connections.drain() {
            let grace = self.settings.disconnect_grace();
            teardown.spawn(async move {
                connection.disconnect(grace).await;
            });
        }
        while let Some(result) = teardown.join_next().await {
            if let Err(e) = result {
                warn!("Disconnect task failed: {}", e);
            }
        }

        if !self.simulator.stop().await {
            self.metrics.reset();
        }
        self.publish_status_locked(&connections);
        info!("All devices disconnected");
    }

    async fn check_liveness(&self) {
        let stale: Vec<DeviceId> = self
            .connections
            .lock()
            .await
            .iter()
            .filter(|(_, c)| !c.is_connected())
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.remove_connection(id, Some("liveness check")).await;
        }
    }

    /// Publish the connection status if it differs from the last one sent.
    /// Callers hold the connections lock so updates go out in order.
    fn publish_status_locked(&self, connections: &HashMap<DeviceId, DeviceConnection>) {
        let mut names: Vec<String> = connections.values().map(|c| c.name().to_string()).collect();
        names.sort();
        if self.simulator.is_running() {
            names.push(SIMULATED_DEVICE_NAME.to_string());
        }
        let status = ConnectionStatus {
            is_connected: !names.is_empty(),
            device_names: names,
        };

        let mut last = self.last_status.lock().unwrap_or_else(PoisonError::into_inner);
        if *last != status {
            info!(
                "Connection status: connected={} devices={:?}",
                status.is_connected, status.device_names
            );
            *last = status.clone();
            self.events.publish_status(status);
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        for task in self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Some stacks never report a dropped link, so poll.
async fn watch_liveness(service: Weak<ServiceInner>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        service.check_liveness().await;
    }
}

async fn watch_lost_devices(service: Weak<ServiceInner>, mut lost: mpsc::UnboundedReceiver<DeviceId>) {
    while let Some(id) = lost.recv().await {
        let Some(service) = service.upgrade() else {
            break;
        };
        service.remove_connection(id, Some("native disconnect")).await;
    }
}
