//! Event fan-out to the presentation layer.
//!
//! Each event type has its own broadcast channel. The receiver returned by a
//! `subscribe_*` call is the subscription handle: dropping it unregisters the
//! listener, so repeated connect/disconnect cycles never accumulate observers.

use crate::domain::models::{ConnectionStatus, CyclingMetrics, MessageSeverity, StatusMessage};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

pub struct EventHub {
    metrics: broadcast::Sender<CyclingMetrics>,
    status: broadcast::Sender<ConnectionStatus>,
    log: broadcast::Sender<StatusMessage>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn with_capacity(capacity: usize) -> Self {
        let (metrics, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        let (log, _) = broadcast::channel(capacity);
        Self {
            metrics,
            status,
            log,
        }
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<CyclingMetrics> {
        self.metrics.subscribe()
    }

    pub fn subscribe_connection_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<StatusMessage> {
        self.log.subscribe()
    }

    // Sends never block; with no subscriber the event is simply dropped.

    pub fn publish_metrics(&self, metrics: CyclingMetrics) {
        let _ = self.metrics.send(metrics);
    }

    pub fn publish_status(&self, status: ConnectionStatus) {
        let _ = self.status.send(status);
    }

    pub fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.log.send(StatusMessage {
            message: message.into(),
            severity,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_subscription_unregisters() {
        let hub = EventHub::default();
        let rx = hub.subscribe_connection_status();
        assert_eq!(hub.status.receiver_count(), 1);
        drop(rx);
        assert_eq!(hub.status.receiver_count(), 0);
        hub.publish_status(ConnectionStatus::disconnected());
    }

    #[test]
    fn test_log_message_delivered() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe_log();
        hub.send_log("Scanning for fitness devices...", MessageSeverity::Info);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.message, "Scanning for fitness devices...");
        assert_eq!(msg.severity, MessageSeverity::Info);
    }
}
