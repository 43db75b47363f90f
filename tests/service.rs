use bike_data_ble::domain::gatt::CharacteristicId;
use bike_data_ble::domain::models::{ConnectionState, ConnectionStatus, DeviceId};
use bike_data_ble::domain::settings::BluetoothSettings;
use bike_data_ble::infrastructure::bluetooth::platform::memory::{MemoryPlatform, MockPeripheral};
use bike_data_ble::infrastructure::bluetooth::simulation::SIMULATED_DEVICE_NAME;
use bike_data_ble::BluetoothService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const TRAINER: DeviceId = DeviceId(0xF1_00_00_00_00_01);
const STRAP: DeviceId = DeviceId(0xF1_00_00_00_00_02);

// flags 0x0044: cadence + power; speed 25.00 km/h, cadence 90 rpm, power 200 W
const BIKE_FRAME: [u8; 8] = [0x44, 0x00, 0xC4, 0x09, 0xB4, 0x00, 0xC8, 0x00];
// flags 0x0040: power only; speed 30.00 km/h, power 250 W
const POWER_ONLY_FRAME: [u8; 6] = [0x40, 0x00, 0xB8, 0x0B, 0xFA, 0x00];

fn settings() -> BluetoothSettings {
    BluetoothSettings {
        scan_timeout_ms: 1_000,
        rescan_timeout_ms: 500,
        ..Default::default()
    }
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

async fn connected_service(peripherals: Vec<MockPeripheral>) -> (BluetoothService, Arc<MemoryPlatform>) {
    let platform = Arc::new(MemoryPlatform::with_peripherals(peripherals));
    let service = BluetoothService::new(platform.clone(), settings());
    let found = service.scan_for_devices(Duration::from_secs(1)).await;
    for device in found {
        assert!(service.connect_to_device(device.id).await);
    }
    (service, platform)
}

#[tokio::test(start_paused = true)]
async fn test_empty_scan_falls_back_to_simulation() {
    let service = BluetoothService::new(Arc::new(MemoryPlatform::new()), settings());
    let mut status_rx = service.subscribe_connection_status();
    let mut metrics_rx = service.subscribe_metrics();

    assert!(service.scan_and_connect().await);
    assert!(service.is_simulating());

    let statuses = drain(&mut status_rx);
    assert_eq!(
        statuses,
        vec![ConnectionStatus {
            is_connected: true,
            device_names: vec![SIMULATED_DEVICE_NAME.to_string()],
        }]
    );

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    let updates = drain(&mut metrics_rx);
    assert!((5..=7).contains(&updates.len()), "{} updates", updates.len());
    for metrics in &updates {
        assert!((100..=200).contains(&metrics.heart_rate));
        assert!(metrics.watts > 0);
    }
    for pair in updates.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }

    let infos = service.device_information().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].1.serial_number, "SIM-KC-2024-001");
    assert_eq!(infos[0].1.firmware_revision, "4.2.1");
}

#[tokio::test(start_paused = true)]
async fn test_double_disconnect_publishes_one_status() {
    let service = BluetoothService::new(Arc::new(MemoryPlatform::new()), settings());
    assert!(service.scan_and_connect().await);
    let mut status_rx = service.subscribe_connection_status();

    service.disconnect().await;
    service.disconnect().await;

    let statuses = drain(&mut status_rx);
    assert_eq!(statuses, vec![ConnectionStatus::disconnected()]);
    assert!(!service.is_simulating());
    assert_eq!(service.get_current_metrics().watts, 0);
    assert_eq!(service.get_current_metrics().heart_rate, 0);
}

#[tokio::test(start_paused = true)]
async fn test_trainer_and_strap_merge_per_field() {
    let (service, platform) = connected_service(vec![
        MockPeripheral::trainer(TRAINER, "KICKR CORE"),
        MockPeripheral::heart_rate_strap(STRAP, "HRM-Pro"),
    ])
    .await;

    assert_eq!(
        service.get_connection_status().device_names,
        vec!["HRM-Pro".to_string(), "KICKR CORE".to_string()]
    );

    platform.notify(TRAINER, CharacteristicId::INDOOR_BIKE_DATA, &BIKE_FRAME);
    platform.notify(STRAP, CharacteristicId::HEART_RATE_MEASUREMENT, &[0x00, 0x8E]);
    let metrics = service.get_current_metrics();
    assert_eq!(metrics.watts, 200);
    assert_eq!(metrics.cadence, 90.0);
    assert_eq!(metrics.speed, 25.0);
    assert_eq!(metrics.heart_rate, 142);

    platform.notify(TRAINER, CharacteristicId::INDOOR_BIKE_DATA, &POWER_ONLY_FRAME);
    let metrics = service.get_current_metrics();
    assert_eq!(metrics.watts, 250);
    assert_eq!(metrics.speed, 30.0);
    assert_eq!(metrics.cadence, 90.0);
    assert_eq!(metrics.heart_rate, 142);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_keeps_connection() {
    let (service, platform) =
        connected_service(vec![MockPeripheral::heart_rate_strap(STRAP, "HRM-Pro")]).await;

    platform.notify(STRAP, CharacteristicId::HEART_RATE_MEASUREMENT, &[0x01, 0x46]);
    platform.notify(STRAP, CharacteristicId::HEART_RATE_MEASUREMENT, &[0x00, 0x46]);

    let records = service.connection_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, ConnectionState::Active);
    assert_eq!(records[0].dropped_frames, 1);
    assert_eq!(service.get_current_metrics().heart_rate, 70);
}

#[tokio::test(start_paused = true)]
async fn test_liveness_poll_removes_silent_drop() {
    let (service, platform) =
        connected_service(vec![MockPeripheral::trainer(TRAINER, "KICKR CORE")]).await;
    let mut status_rx = service.subscribe_connection_status();

    platform.drop_link(TRAINER);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(service.connection_records().await.is_empty());
    assert_eq!(drain(&mut status_rx), vec![ConnectionStatus::disconnected()]);
    assert_eq!(platform.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_native_disconnect_callback_removes_record() {
    let (service, platform) = connected_service(vec![
        MockPeripheral::trainer(TRAINER, "KICKR CORE"),
        MockPeripheral::heart_rate_strap(STRAP, "HRM-Pro"),
    ])
    .await;
    let mut status_rx = service.subscribe_connection_status();

    platform.fire_disconnect(STRAP);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(service.connected_device_names().await, vec!["KICKR CORE".to_string()]);
    assert_eq!(
        drain(&mut status_rx),
        vec![ConnectionStatus {
            is_connected: true,
            device_names: vec!["KICKR CORE".to_string()],
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_leaves_no_record() {
    let platform = Arc::new(MemoryPlatform::with_peripherals([MockPeripheral::trainer(
        TRAINER,
        "KICKR CORE",
    )
    .refusing_connections()]));
    let service = BluetoothService::new(platform.clone(), settings());

    assert_eq!(service.scan_for_devices(Duration::from_secs(1)).await.len(), 1);
    assert!(!service.connect_to_device(TRAINER).await);
    assert!(service.connection_records().await.is_empty());
    assert!(!service.get_connection_status().is_connected);
    assert_eq!(platform.open_sessions(), 0);

    // scan_and_connect falls back once the only candidate fails
    assert!(service.scan_and_connect().await);
    assert!(service.is_simulating());
}

#[tokio::test(start_paused = true)]
async fn test_real_device_replaces_simulation() {
    let platform = Arc::new(MemoryPlatform::new());
    let service = BluetoothService::new(platform.clone(), settings());
    assert!(service.scan_and_connect().await);
    assert!(service.is_simulating());

    platform.add_peripheral(MockPeripheral::trainer(TRAINER, "KICKR CORE"));
    assert!(service.connect_to_device(TRAINER).await);

    assert!(!service.is_simulating());
    assert_eq!(
        service.get_connection_status().device_names,
        vec!["KICKR CORE".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_first_real_frame_survives_leaving_simulation() {
    let platform = Arc::new(MemoryPlatform::new());
    let service = BluetoothService::new(platform.clone(), settings());
    assert!(service.scan_and_connect().await);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(service.get_current_metrics().heart_rate > 0);

    platform.add_peripheral(
        MockPeripheral::trainer(TRAINER, "KICKR CORE")
            .with_frame_on_subscribe(CharacteristicId::INDOOR_BIKE_DATA, BIKE_FRAME.to_vec()),
    );
    assert!(service.connect_to_device(TRAINER).await);

    let metrics = service.get_current_metrics();
    assert_eq!(metrics.watts, 200);
    assert_eq!(metrics.cadence, 90.0);
    assert_eq!(metrics.speed, 25.0);
    assert_eq!(metrics.heart_rate, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_all_candidates() {
    let platform = Arc::new(MemoryPlatform::with_peripherals([
        MockPeripheral::trainer(TRAINER, "KICKR CORE"),
        MockPeripheral::heart_rate_strap(STRAP, "HRM-Pro"),
    ]));
    let service = BluetoothService::new(
        platform.clone(),
        BluetoothSettings {
            connect_all_candidates: true,
            ..settings()
        },
    );

    assert!(service.scan_and_connect().await);
    assert!(!service.is_simulating());
    assert_eq!(service.connection_records().await.len(), 2);
    assert_eq!(platform.scan_stops(), 1);

    let trainer = service
        .connection_records()
        .await
        .into_iter()
        .find(|r| r.descriptor.id == TRAINER)
        .unwrap();
    assert_eq!(trainer.device_info.unwrap().serial_number, "WF-123456");
    assert_eq!(trainer.descriptor.device_type(), "Smart Trainer");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all_is_bounded_by_grace() {
    let (service, platform) = connected_service(vec![
        MockPeripheral::trainer(TRAINER, "KICKR CORE").with_unsubscribe_delay(Duration::from_secs(60)),
        MockPeripheral::heart_rate_strap(STRAP, "HRM-Pro").with_unsubscribe_delay(Duration::from_secs(60)),
    ])
    .await;

    let started = tokio::time::Instant::now();
    service.disconnect_all().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(platform.gatt_disconnects(), 2);
    assert!(!service.get_connection_status().is_connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all_discards_connect_in_flight() {
    let platform = Arc::new(MemoryPlatform::with_peripherals([MockPeripheral::trainer(
        TRAINER,
        "KICKR CORE",
    )
    .with_connect_delay(Duration::from_secs(3))]));
    let service = BluetoothService::new(platform.clone(), settings());
    assert_eq!(service.scan_for_devices(Duration::from_secs(1)).await.len(), 1);
    let mut status_rx = service.subscribe_connection_status();

    let pending = tokio::spawn({
        let service = service.clone();
        async move { service.connect_to_device(TRAINER).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    service.disconnect_all().await;

    assert!(!pending.await.unwrap());
    assert!(service.connection_records().await.is_empty());
    assert!(!service.get_connection_status().is_connected);
    assert!(drain(&mut status_rx).is_empty());
    assert_eq!(platform.open_sessions(), 0);
    assert_eq!(platform.gatt_disconnects(), 1);
}
