//! Clock port: monotonic time for scheduling, wall-clock time for
//! timestamps on the wire.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

pub trait Clock {
    /// Monotonic instant for deadlines, backoff and pacing.
    fn now(&self) -> Instant;

    /// Wall-clock time.
    fn wall(&self) -> DateTime<Utc>;

    /// ISO-8601 UTC timestamp with millisecond precision, `Z` suffix.
    fn iso8601(&self) -> String {
        self.wall().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// The real thing.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct SimulatedInner {
    base: Instant,
    elapsed: Duration,
    wall: DateTime<Utc>,
}

/// Manually advanced clock for tests. Clones share the same time source.
#[derive(Clone)]
pub struct SimulatedClock(Rc<RefCell<SimulatedInner>>);

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClock {
    pub fn new() -> Self {
        let wall = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self(Rc::new(RefCell::new(SimulatedInner {
            base: Instant::now(),
            elapsed: Duration::ZERO,
            wall,
        })))
    }

    pub fn advance(&self, delta: Duration) {
        let mut inner = self.0.borrow_mut();
        inner.elapsed += delta;
        inner.wall += chrono::Duration::from_std(delta).unwrap_or_default();
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Instant {
        let inner = self.0.borrow();
        inner.base + inner.elapsed
    }

    fn wall(&self) -> DateTime<Utc> {
        self.0.borrow().wall
    }
}
