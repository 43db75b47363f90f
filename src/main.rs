use bike_data_ble::domain::models::MessageSeverity;
use bike_data_ble::domain::settings::SettingsService;
use bike_data_ble::infrastructure::logging::init_logger;
use bike_data_ble::{resolve_platform, BluetoothService};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting bike data BLE service");
    info!("Settings file: {}", settings_service.path().display());

    let platform = match resolve_platform(&settings.bluetooth) {
        Ok(platform) => platform,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let service = BluetoothService::new(platform, settings.bluetooth);
    let mut metrics_rx = service.subscribe_metrics();
    let mut status_rx = service.subscribe_connection_status();
    let mut log_rx = service.subscribe_log();

    if !service.scan_and_connect().await {
        warn!("No data source available");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            metrics = metrics_rx.recv() => match metrics {
                Ok(m) => info!(
                    "{} W | {:.0} rpm | {:.1} km/h | {} bpm",
                    m.watts, m.cadence, m.speed, m.heart_rate
                ),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} metrics updates", n),
                Err(RecvError::Closed) => break,
            },
            status = status_rx.recv() => match status {
                Ok(s) if s.is_connected => info!("Connected: {}", s.device_names.join(", ")),
                Ok(_) => info!("Disconnected"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            message = log_rx.recv() => match message {
                Ok(m) if m.severity == MessageSeverity::Error => error!("{}", m.message),
                Ok(m) if m.severity == MessageSeverity::Warning => warn!("{}", m.message),
                Ok(m) => info!("{}", m.message),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.disconnect_all().await;
    Ok(())
}
