//! Battery simulation: slow drain with jitter, faster while driving, and
//! a voltage reading derived from the charge level.

use crate::event::Battery;
use crate::rng::Rng;

const IDLE_DRAIN_PER_HOUR: f64 = 0.5;
const DRIVING_DRAIN_PER_HOUR: f64 = 2.0;
const MIN_VOLTAGE: f64 = 3.2;
const MAX_VOLTAGE: f64 = 4.2;

#[derive(Clone, Copy, Debug)]
pub struct BatteryModel {
    percent: f64,
}

impl Default for BatteryModel {
    fn default() -> Self {
        Self { percent: 100.0 }
    }
}

impl BatteryModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn set_percent(&mut self, pct: f64) {
        self.percent = pct.clamp(0.0, 100.0);
    }

    /// Drains the battery for the elapsed interval, ±10% jitter.
    pub fn tick(&mut self, rng: &mut dyn Rng, delta_seconds: f64, driving: bool) {
        let rate = if driving {
            DRIVING_DRAIN_PER_HOUR
        } else {
            IDLE_DRAIN_PER_HOUR
        };
        let base_drain = (rate / 3600.0) * delta_seconds;
        let drain = base_drain * (1.0 + rng.uniform(-0.1, 0.1));

        self.percent = (self.percent - drain).clamp(0.0, 100.0);
    }

    /// Current reading with a jittered voltage in the 3.2–4.2 V window.
    pub fn info(&self, rng: &mut dyn Rng) -> Battery {
        let range = MAX_VOLTAGE - MIN_VOLTAGE;
        let voltage = MIN_VOLTAGE + (self.percent / 100.0) * range + rng.uniform(-0.05, 0.05);

        Battery {
            percent: self.percent,
            voltage: voltage.clamp(MIN_VOLTAGE, MAX_VOLTAGE),
        }
    }
}
