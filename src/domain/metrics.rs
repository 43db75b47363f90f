//! Single-writer cell holding the merged [`CyclingMetrics`] snapshot.
//!
//! Every writer (notification callbacks, the simulator tick, disconnect
//! resets) goes through the same mutex-guarded replace, and the metrics event
//! is published while the lock is held so subscribers observe snapshots in
//! timestamp order. Readers get a cheap `Arc` clone and never see a
//! half-applied update.

use crate::domain::events::EventHub;
use crate::domain::models::{CyclingMetrics, TrainerSample};
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};

pub struct MetricsStore {
    current: Mutex<Arc<CyclingMetrics>>,
    events: Arc<EventHub>,
}

impl MetricsStore {
    pub fn new(events: Arc<EventHub>) -> Self {
        Self {
            current: Mutex::new(Arc::new(CyclingMetrics::zero(Utc::now()))),
            events,
        }
    }

    /// Latest snapshot.
    pub fn current(&self) -> CyclingMetrics {
        let guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        CyclingMetrics::clone(&guard)
    }

    /// Merge one frame, last writer wins per field.
    pub fn apply(&self, sample: &TrainerSample) -> CyclingMetrics {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let next = guard.merged(sample, Utc::now());
        *guard = Arc::new(next.clone());
        self.events.publish_metrics(next.clone());
        next
    }

    /// Back to the zero snapshot (simulation stopped, last device gone).
    pub fn reset(&self) -> CyclingMetrics {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let next = CyclingMetrics::zero(Utc::now().max(guard.timestamp));
        *guard = Arc::new(next.clone());
        self.events.publish_metrics(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (MetricsStore, Arc<EventHub>) {
        let events = Arc::new(EventHub::default());
        (MetricsStore::new(events.clone()), events)
    }

    #[test]
    fn test_hr_then_power_keeps_other_fields() {
        let (store, _) = store();
        store.apply(
            &TrainerSample::default()
                .with_power(180)
                .with_cadence(88.0)
                .with_speed(30.5),
        );
        store.apply(&TrainerSample::default().with_heart_rate(142));
        let after = store.apply(&TrainerSample::default().with_power(250));

        assert_eq!(after.watts, 250);
        assert_eq!(after.cadence, 88.0);
        assert_eq!(after.speed, 30.5);
        assert_eq!(after.heart_rate, 142);
    }

    #[test]
    fn test_every_apply_publishes() {
        let (store, events) = store();
        let mut rx = events.subscribe_metrics();
        store.apply(&TrainerSample::default().with_heart_rate(120));
        store.apply(&TrainerSample::default().with_heart_rate(121));
        assert_eq!(rx.try_recv().unwrap().heart_rate, 120);
        assert_eq!(rx.try_recv().unwrap().heart_rate, 121);
    }

    #[test]
    fn test_timestamps_monotonic() {
        let (store, _) = store();
        let mut last = store.current().timestamp;
        for i in 0..50 {
            let snapshot = store.apply(&TrainerSample::default().with_power(i));
            assert!(snapshot.timestamp >= last);
            last = snapshot.timestamp;
        }
        assert!(store.reset().timestamp >= last);
    }

    #[test]
    fn test_reset_zeroes_fields() {
        let (store, _) = store();
        store.apply(&TrainerSample::default().with_power(300).with_heart_rate(170));
        let zero = store.reset();
        assert_eq!(zero.watts, 0);
        assert_eq!(zero.heart_rate, 0);
        assert_eq!(store.current().watts, 0);
    }
}
