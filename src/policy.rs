//! Retry and reporting policies. Trait seams so deployments can swap the
//! defaults; the defaults match the production tuning.

use std::time::Duration;

/// Decides delivery retries for queued telemetry and reconnect pacing.
pub trait RetryPolicy {
    /// Backoff before the given attempt; `attempts` starts at 1.
    fn backoff(&self, attempts: u32) -> Duration;

    /// Whether another attempt should be made after `attempts` failures.
    fn should_retry(&self, attempts: u32) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let factor = self.multiplier.powi(exponent as i32);
        let delay = self.base.mul_f64(factor.max(1.0));
        delay.min(self.cap)
    }

    fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Decides what gets reported and how often heartbeats go out.
pub trait ReportingPolicy {
    /// Heartbeat cadence: shorter while in motion.
    fn heartbeat_interval(&self, in_motion: bool) -> Duration;

    /// Whether motion edges are reported at all.
    fn report_motion_change(&self) -> bool {
        true
    }

    /// Whether a battery-driven event is worth reporting given the last
    /// reported level.
    fn report_battery_level(&self, current_pct: f64, last_reported_pct: f64) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct AdaptiveReporting {
    pub stationary: Duration,
    pub moving: Duration,
    /// Minimum battery delta, in percentage points, worth a report.
    pub battery_delta_pct: f64,
}

impl Default for AdaptiveReporting {
    fn default() -> Self {
        Self {
            stationary: Duration::from_secs(60),
            moving: Duration::from_secs(20),
            battery_delta_pct: 5.0,
        }
    }
}

impl ReportingPolicy for AdaptiveReporting {
    fn heartbeat_interval(&self, in_motion: bool) -> Duration {
        if in_motion {
            self.moving
        } else {
            self.stationary
        }
    }

    fn report_battery_level(&self, current_pct: f64, last_reported_pct: f64) -> bool {
        (current_pct - last_reported_pct).abs() >= self.battery_delta_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let policy = ExponentialBackoff::default();

        let mut last = Duration::ZERO;
        for attempts in 1..20 {
            let delay = policy.backoff(attempts);
            assert!(delay >= last, "attempt {attempts} regressed");
            assert!(delay <= policy.cap);
            last = delay;
        }

        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn retry_budget() {
        let policy = ExponentialBackoff::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn battery_delta_threshold() {
        let policy = AdaptiveReporting::default();
        assert!(policy.report_battery_level(80.0, 90.0));
        assert!(policy.report_battery_level(95.0, 90.0));
        assert!(!policy.report_battery_level(87.0, 90.0));
        assert!(policy.report_motion_change());
    }

    #[test]
    fn heartbeat_cadence_shorter_in_motion() {
        let policy = AdaptiveReporting::default();
        assert!(policy.heartbeat_interval(true) < policy.heartbeat_interval(false));
    }
}
