use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bike_data_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which BLE capability the service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The OS Bluetooth stack.
    #[default]
    Native,
    /// No radio at all; scans come back empty and the simulator takes over.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Scan used by `connect_to_device` when the id has not been seen yet.
    #[serde(default = "default_rescan_timeout_ms")]
    pub rescan_timeout_ms: u64,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    #[serde(default = "default_simulation_tick_ms")]
    pub simulation_tick_ms: u64,
    #[serde(default = "default_false")]
    pub show_all_devices: bool,
    #[serde(default = "default_true")]
    pub simulation_fallback: bool,
    #[serde(default = "default_false")]
    pub connect_all_candidates: bool,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rescan_timeout_ms: default_rescan_timeout_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            simulation_tick_ms: default_simulation_tick_ms(),
            show_all_devices: default_false(),
            simulation_fallback: default_true(),
            connect_all_candidates: default_false(),
        }
    }
}

impl BluetoothSettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rescan_timeout(&self) -> Duration {
        Duration::from_millis(self.rescan_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn simulation_tick(&self) -> Duration {
        Duration::from_millis(self.simulation_tick_ms)
    }
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_rescan_timeout_ms() -> u64 {
    5_000
}
fn default_liveness_interval_ms() -> u64 {
    5_000
}
fn default_disconnect_grace_ms() -> u64 {
    2_000
}
fn default_simulation_tick_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub bluetooth: BluetoothSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

/// Read-only access to `settings.json` in the user config directory.
pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit path; a missing or malformed file yields defaults.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BikeDataOverlay");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "bluetooth": { "backend": "simulated", "scan_timeout_ms": 3000 } }"#)
                .unwrap();
        assert_eq!(settings.bluetooth.backend, BackendKind::Simulated);
        assert_eq!(settings.bluetooth.scan_timeout(), Duration::from_secs(3));
        assert_eq!(settings.bluetooth.liveness_interval(), Duration::from_secs(5));
        assert_eq!(settings.bluetooth.disconnect_grace(), Duration::from_secs(2));
        assert!(settings.bluetooth.simulation_fallback);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("bike_data_ble_does_not_exist.json");
        let service = SettingsService::from_path(path);
        assert_eq!(service.get().bluetooth.backend, BackendKind::Native);
        assert_eq!(service.get().bluetooth.simulation_tick(), Duration::from_secs(1));
    }
}
