//! Synthetic trainer used when no real hardware is reachable.
//!
//! Values follow a slow intensity wave with per-metric oscillations and
//! uniform noise, so the overlay shows plausible movement. The shape is
//! reproducible; individual values are not.

use crate::domain::metrics::MetricsStore;
use crate::domain::models::{DeviceInformation, TrainerSample};
use crate::infrastructure::bluetooth::protocol::machine_features;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const SIMULATED_DEVICE_NAME: &str = "Simulated KICKR CORE";

pub fn simulated_device_information() -> DeviceInformation {
    DeviceInformation {
        manufacturer_name: "Simulated".to_string(),
        model_number: "KICKR CORE".to_string(),
        serial_number: "SIM-KC-2024-001".to_string(),
        firmware_revision: "4.2.1".to_string(),
        supported_features: machine_features::POWER_MEASUREMENT
            | machine_features::CADENCE
            | machine_features::RESISTANCE_LEVEL,
    }
}

/// Workout intensity in `[0.4, 1.0]` at second `t`.
pub fn intensity_at(t: u64) -> f64 {
    0.7 + 0.3 * (t as f64 / 30.0).sin()
}

/// Synthetic frame for second `t` of the ride, `distance_m` ridden so far.
pub fn sample_at<R: Rng>(t: u64, distance_m: f64, rng: &mut R) -> TrainerSample {
    let secs = t as f64;
    let intensity = intensity_at(t);

    let power = 180.0 + 50.0 * intensity + 15.0 * (secs / 10.0).sin() + rng.gen_range(-8.0_f64..=8.0);
    let cadence = 85.0 + 15.0 * intensity + 8.0 * (secs / 12.0).cos() + rng.gen_range(-3.0_f64..=3.0);
    let speed = 28.0 + 8.0 * intensity + 3.0 * (secs / 15.0).sin() + rng.gen_range(-1.0_f64..=1.0);
    let heart_rate = 135.0 + 25.0 * intensity + rng.gen_range(-5.0_f64..=8.0);

    TrainerSample::default()
        .with_power(power.max(0.0).round() as i16)
        .with_cadence(cadence.max(0.0))
        .with_speed(speed.max(0.0))
        .with_heart_rate(heart_rate.round().clamp(0.0, 255.0) as u8)
        .with_resistance_level(5 + (3.0 * intensity) as i16)
        .with_distance(distance_m as u32)
        .with_elapsed_time(Duration::from_secs(t))
        .with_expended_energy((secs * 0.5) as u16)
}

struct RunningSimulation {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SimulationGenerator {
    metrics: Arc<MetricsStore>,
    tick: Duration,
    running: Mutex<Option<RunningSimulation>>,
}

impl SimulationGenerator {
    pub fn new(metrics: Arc<MetricsStore>, tick: Duration) -> Self {
        Self {
            metrics,
            tick,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start ticking. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        info!("Starting simulation mode: {}", SIMULATED_DEVICE_NAME);
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(run_simulation(self.metrics.clone(), self.tick, cancelled));
        *running = Some(RunningSimulation { cancel, task });
        true
    }

    /// Stop ticking and reset metrics to zero. Returns `false` if not running.
    pub async fn stop(&self) -> bool {
        let Some(simulation) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };

        let _ = simulation.cancel.send(true);
        let _ = simulation.task.await;
        self.metrics.reset();
        info!("Simulation mode stopped");
        true
    }
}

async fn run_simulation(metrics: Arc<MetricsStore>, tick: Duration, mut cancelled: watch::Receiver<bool>) {
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(tick);
    let mut elapsed: u64 = 0;
    let mut distance_m = 0.0;

    loop {
        tokio::select! {
            _ = cancelled.changed() => break,
            _ = interval.tick() => {
                let sample = sample_at(elapsed, distance_m, &mut rng);
                let snapshot = metrics.apply(&sample);
                distance_m += snapshot.speed / 3.6 * tick.as_secs_f64();
                elapsed += 1;

                if elapsed % 10 == 0 {
                    debug!(
                        "Simulated: {} W, {:.0} rpm, {:.1} km/h, {} bpm, {:.0} m",
                        snapshot.watts, snapshot.cadence, snapshot.speed, snapshot.heart_rate, distance_m
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventHub;

    #[test]
    fn test_samples_stay_in_plausible_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for t in 0..3600 {
            let sample = sample_at(t, 0.0, &mut rng);
            let hr = sample.heart_rate().unwrap();
            assert!((100..=200).contains(&hr), "hr {} at t={}", hr, t);
            let power = sample.power().unwrap();
            assert!((150..=270).contains(&power), "power {} at t={}", power, t);
            let cadence = sample.cadence().unwrap();
            assert!((80.0..=111.0).contains(&cadence), "cadence {} at t={}", cadence, t);
            let speed = sample.speed().unwrap();
            assert!((27.0..=40.0).contains(&speed), "speed {} at t={}", speed, t);
        }
    }

    #[test]
    fn test_intensity_envelope() {
        for t in 0..1000 {
            let i = intensity_at(t);
            assert!((0.4..=1.0).contains(&i));
        }
    }

    #[test]
    fn test_sample_carries_ride_totals() {
        let mut rng = StdRng::seed_from_u64(1);
        let sample = sample_at(120, 1500.7, &mut rng);
        assert_eq!(sample.elapsed_time(), Some(Duration::from_secs(120)));
        assert_eq!(sample.distance_meters(), Some(1500));
        assert_eq!(sample.expended_energy_kcal(), Some(60));
        assert!((5..=8).contains(&sample.resistance_level().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_second_until_stopped() {
        let events = Arc::new(EventHub::default());
        let metrics = Arc::new(MetricsStore::new(events.clone()));
        let generator = SimulationGenerator::new(metrics.clone(), Duration::from_secs(1));
        let mut rx = events.subscribe_metrics();

        assert!(generator.start());
        assert!(!generator.start());
        tokio::time::sleep(Duration::from_millis(4500)).await;

        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 5);

        assert!(generator.stop().await);
        assert!(!generator.stop().await);
        assert!(!generator.is_running());
        assert_eq!(metrics.current().watts, 0);
        assert_eq!(metrics.current().heart_rate, 0);
    }
}
