//! BLE Scanner Module
//!
//! Turns the platform's raw advertisement stream into a deduplicated,
//! time-bounded stream of [`DeviceDescriptor`]s.

use crate::domain::events::EventHub;
use crate::domain::gatt::ServiceId;
use crate::domain::models::{DeviceDescriptor, DeviceId, MessageSeverity};
use crate::error::BleError;
use crate::infrastructure::bluetooth::platform::{BlePlatform, RawAdvertisement};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name fragments of vendors whose trainers sometimes omit service UUIDs
/// from the first advertisement.
pub const KNOWN_MANUFACTURERS: [&str; 6] = ["wahoo", "garmin", "polar", "coospo", "kickr", "tacx"];

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    DeviceFound(DeviceDescriptor),
    /// Always the last event of a scan session.
    ScanComplete {
        devices_found: usize,
        error: Option<BleError>,
    },
}

/// Whether an advertisement passes the scan filter. An empty filter passes everything.
pub fn matches_filter(adv: &RawAdvertisement, filter: &[ServiceId]) -> bool {
    if filter.is_empty() {
        return true;
    }
    if adv.service_ids.iter().any(|s| filter.contains(s)) {
        return true;
    }
    adv.local_name
        .as_deref()
        .map(|name| {
            let name = name.to_lowercase();
            KNOWN_MANUFACTURERS.iter().any(|m| name.contains(m))
        })
        .unwrap_or(false)
}

pub fn descriptor_from(adv: RawAdvertisement) -> DeviceDescriptor {
    DeviceDescriptor {
        id: adv.address,
        name: adv
            .local_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        advertised_service_ids: adv.service_ids.into_iter().collect(),
        signal_strength: adv.rssi,
        connectable: adv.connectable,
    }
}

struct ActiveScan {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// BLE Scanner for discovering fitness devices
pub struct DeviceScanner {
    platform: Arc<dyn BlePlatform>,
    events: Arc<EventHub>,
    active: Mutex<Option<ActiveScan>>,
}

impl DeviceScanner {
    pub fn new(platform: Arc<dyn BlePlatform>, events: Arc<EventHub>) -> Self {
        Self {
            platform,
            events,
            active: Mutex::new(None),
        }
    }

    /// Start scanning. Any scan already running is stopped first.
    ///
    /// The returned stream yields each matching device once and always ends
    /// with [`ScanEvent::ScanComplete`].
    pub async fn start_scan(
        &self,
        filter: Vec<ServiceId>,
        timeout: Duration,
    ) -> mpsc::UnboundedReceiver<ScanEvent> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Stopping previous scan before starting a new one");
            Self::finish(previous).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        info!("Starting BLE scan ({} service filters, {:?})", filter.len(), timeout);
        self.events
            .send_log("Scanning for fitness devices...", MessageSeverity::Info);

        let adverts = match self.platform.scan_advertisements(&filter).await {
            Ok(adverts) => adverts,
            Err(e) => {
                warn!("Failed to start BLE scan: {}", e);
                self.events
                    .send_log(format!("Scan failed: {}", e), MessageSeverity::Error);
                let _ = tx.send(ScanEvent::ScanComplete {
                    devices_found: 0,
                    error: Some(BleError::ScanFailed(e.to_string())),
                });
                return rx;
            }
        };

        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(run_scan(
            self.platform.clone(),
            self.events.clone(),
            adverts,
            filter,
            timeout,
            cancelled,
            tx,
        ));
        *active = Some(ActiveScan { cancel, task });
        rx
    }

    /// Stop the running scan, if any, and wait for it to wind down.
    pub async fn stop_scan(&self) {
        if let Some(scan) = self.active.lock().await.take() {
            Self::finish(scan).await;
        }
    }

    /// Whether a scan task is still running
    pub async fn is_scanning(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|scan| !scan.task.is_finished())
            .unwrap_or(false)
    }

    /// Scan to completion and collect the devices found.
    pub async fn scan_for(&self, filter: Vec<ServiceId>, timeout: Duration) -> Vec<DeviceDescriptor> {
        let mut rx = self.start_scan(filter, timeout).await;
        let mut devices = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::DeviceFound(device) => devices.push(device),
                ScanEvent::ScanComplete { error, .. } => {
                    if let Some(e) = error {
                        warn!("Scan ended with error: {}", e);
                    }
                    break;
                }
            }
        }
        devices
    }

    async fn finish(scan: ActiveScan) {
        let _ = scan.cancel.send(true);
        if let Err(e) = scan.task.await {
            warn!("Scan task ended abnormally: {}", e);
        }
    }
}

/// Scan loop. The native stop is issued here and only here, after whichever
/// of timeout, cancellation or stream end comes first.
async fn run_scan(
    platform: Arc<dyn BlePlatform>,
    events: Arc<EventHub>,
    mut adverts: mpsc::UnboundedReceiver<RawAdvertisement>,
    filter: Vec<ServiceId>,
    timeout: Duration,
    mut cancelled: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<ScanEvent>,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut emitted: HashSet<DeviceId> = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("Scan timeout reached");
                break;
            }
            _ = cancelled.changed() => {
                debug!("Scan cancelled");
                break;
            }
            adv = adverts.recv() => {
                let Some(adv) = adv else { break };
                if emitted.contains(&adv.address) || !matches_filter(&adv, &filter) {
                    continue;
                }
                emitted.insert(adv.address);
                let device = descriptor_from(adv);
                info!(
                    "Found device: {} ({}) RSSI {} dBm [{}]",
                    device.name,
                    device.id,
                    device.signal_strength,
                    device.device_type()
                );
                let _ = tx.send(ScanEvent::DeviceFound(device));
            }
        }
    }

    let error = platform.stop_scan().await.err();
    if let Some(e) = &error {
        warn!("Native scan stop failed: {}", e);
    }
    info!("Scan complete: {} device(s) found", emitted.len());
    events.send_log(
        format!("Scan complete: {} device(s) found", emitted.len()),
        MessageSeverity::Info,
    );
    let _ = tx.send(ScanEvent::ScanComplete {
        devices_found: emitted.len(),
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::platform::memory::{MemoryPlatform, MockPeripheral};

    fn advert(name: Option<&str>, services: Vec<ServiceId>) -> RawAdvertisement {
        RawAdvertisement {
            address: DeviceId(1),
            local_name: name.map(str::to_string),
            service_ids: services,
            rssi: -50,
            connectable: true,
        }
    }

    #[test]
    fn test_filter_by_service() {
        let filter = [ServiceId::FITNESS_MACHINE, ServiceId::HEART_RATE];
        assert!(matches_filter(&advert(None, vec![ServiceId::HEART_RATE]), &filter));
        assert!(!matches_filter(&advert(Some("Speaker"), vec![]), &filter));
    }

    #[test]
    fn test_filter_by_manufacturer_name() {
        let filter = [ServiceId::FITNESS_MACHINE];
        assert!(matches_filter(&advert(Some("Wahoo KICKR 1A2B"), vec![]), &filter));
        assert!(matches_filter(&advert(Some("TACX NEO"), vec![]), &filter));
        assert!(!matches_filter(&advert(None, vec![]), &filter));
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        assert!(matches_filter(&advert(None, vec![]), &[]));
    }

    #[test]
    fn test_descriptor_defaults_unknown_name() {
        let device = descriptor_from(advert(Some("  "), vec![ServiceId::CYCLING_POWER]));
        assert_eq!(device.name, "Unknown");
        assert_eq!(device.device_type(), "Power Meter");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_advertisements_emitted_once() {
        let platform = Arc::new(MemoryPlatform::with_peripherals([MockPeripheral::trainer(
            DeviceId(0xA1),
            "KICKR CORE",
        )
        .with_advertisement_repeats(2)]));
        let scanner = DeviceScanner::new(platform.clone(), Arc::new(EventHub::default()));

        let devices = scanner
            .scan_for(ServiceId::FITNESS.to_vec(), Duration::from_secs(10))
            .await;

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, DeviceId(0xA1));
        assert_eq!(platform.scan_stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_advertisement_reported_once_with_rssi() {
        let platform = Arc::new(MemoryPlatform::with_peripherals([MockPeripheral::trainer(
            DeviceId(0xA1),
            "KICKR CORE",
        )
        .with_rssi(-72)]));
        let scanner = DeviceScanner::new(platform.clone(), Arc::new(EventHub::default()));

        let mut rx = scanner.start_scan(vec![], Duration::from_secs(10)).await;
        let Some(ScanEvent::DeviceFound(first)) = rx.recv().await else {
            panic!("expected the trainer first");
        };
        assert_eq!(first.signal_strength, -72);

        let late = MockPeripheral::heart_rate_strap(DeviceId(0xB2), "HRM-Pro").advertisement;
        assert!(platform.advertise(late.clone()));
        assert!(platform.advertise(late));
        let Some(ScanEvent::DeviceFound(second)) = rx.recv().await else {
            panic!("expected the strap");
        };
        assert_eq!(second.id, DeviceId(0xB2));

        scanner.stop_scan().await;
        assert!(matches!(
            rx.recv().await,
            Some(ScanEvent::ScanComplete { devices_found: 2, error: None })
        ));
        assert!(!platform.advertise(MockPeripheral::new(DeviceId(0xC3), "Late").advertisement));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_after_timeout_stops_native_once() {
        let platform = Arc::new(MemoryPlatform::new());
        let scanner = DeviceScanner::new(platform.clone(), Arc::new(EventHub::default()));

        let mut rx = scanner.start_scan(vec![], Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            rx.recv().await,
            Some(ScanEvent::ScanComplete { devices_found: 0, error: None })
        ));
        scanner.stop_scan().await;
        scanner.stop_scan().await;

        assert_eq!(platform.scan_stops(), 1);
        assert!(!scanner.is_scanning().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_scan_stops_previous() {
        let platform = Arc::new(MemoryPlatform::new());
        let scanner = DeviceScanner::new(platform.clone(), Arc::new(EventHub::default()));

        let mut first = scanner.start_scan(vec![], Duration::from_secs(30)).await;
        let _second = scanner.start_scan(vec![], Duration::from_secs(30)).await;

        assert!(matches!(
            first.recv().await,
            Some(ScanEvent::ScanComplete { .. })
        ));
        assert_eq!(platform.scan_starts(), 2);
        assert_eq!(platform.scan_stops(), 1);
        assert!(scanner.is_scanning().await);
    }
}
