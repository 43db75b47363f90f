//! Bluetooth Module
//!
//! Provides BLE connectivity to indoor trainers and heart-rate monitors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                     │
//! │   (coordinator: merge, liveness, simulation fallback)   │
//! └──────┬──────────────┬──────────────┬──────────────┬─────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌────────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │  │ Simulation │
//! │           │  │            │  │          │  │            │
//! │ - dedup   │  │ - GATT     │  │ - FTMS   │  │ - 1 Hz     │
//! │ - filter  │  │ - notify   │  │ - HR     │  │   ticks    │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘  └────────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │   platform::BlePlatform     │
//! │   (memory | winrt)          │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT payload decoders (Indoor Bike Data, Heart Rate, Cycling Power)
//! - [`scanner`] - Device discovery
//! - [`connection`] - Per-device GATT session state machine
//! - [`simulation`] - Synthetic trainer data
//! - [`service`] - Main service coordinator
//! - [`platform`] - Native BLE capability and backends

pub mod connection;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulation;

// Re-export main service for convenience
pub use service::BluetoothService;
