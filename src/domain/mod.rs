pub mod events;
pub mod gatt;
pub mod metrics;
pub mod models;
pub mod settings;
