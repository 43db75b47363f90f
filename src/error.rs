//! Error types shared by the BLE layer.

use thiserror::Error;

/// Failures surfaced by the platform capability and the connection layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("no Bluetooth LE implementation available for platform: {os}")]
    PlatformUnsupported { os: String },

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device disconnected")]
    Disconnected,
}

/// A characteristic payload that could not be decoded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}
