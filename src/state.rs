//! The device state machine.
//!
//! Translates external inputs (ignition, motion, battery level, geofence
//! membership, speed samples, connectivity) into exactly one active
//! [`DeviceState`] and edge-only domain events. The machine is pure with
//! respect to its inputs: the same input sequence from the same initial
//! state yields the same state trajectory and events. Invalid transitions
//! are no-ops.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::event::{EventKind, Extras};

pub const LOW_BATTERY_THRESHOLD: f64 = 20.0;
pub const PARKING_TIMEOUT: Duration = Duration::from_secs(2 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Driving,
    Parked,
    LowBattery,
    Offline,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Driving => "driving",
            DeviceState::Parked => "parked",
            DeviceState::LowBattery => "low-battery",
            DeviceState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event raised by a state transition or qualifying input, before
/// the telemetry pipeline enriches it into a full envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub extras: Extras,
}

impl DomainEvent {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            extras: Extras::new(),
        }
    }

    fn with_extras<const N: usize>(kind: EventKind, extras: [(&str, String); N]) -> Self {
        Self {
            kind,
            extras: extras
                .into_iter()
                .map(|(k, v)| (k.to_string(), Some(v)))
                .collect(),
        }
    }
}

pub struct StateMachine {
    state: DeviceState,
    ignition: bool,
    motion: bool,
    battery_percent: f64,
    connected: bool,
    speed_over_limit: bool,
    inside: BTreeSet<String>,
    parked_at: Option<Instant>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Idle,
            ignition: false,
            motion: false,
            battery_percent: 100.0,
            connected: true,
            speed_over_limit: false,
            inside: BTreeSet::new(),
            parked_at: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn in_motion(&self) -> bool {
        self.motion
    }

    pub fn ignition_on(&self) -> bool {
        self.ignition
    }

    fn battery_low(&self) -> bool {
        self.battery_percent < LOW_BATTERY_THRESHOLD
    }

    /// Ignition edge. Repeated inputs with the same value are no-ops.
    pub fn ignition(&mut self, on: bool, now: Instant) -> Option<DomainEvent> {
        if self.ignition == on {
            return None;
        }
        self.ignition = on;

        match self.state {
            DeviceState::Idle if on => {
                if self.battery_low() {
                    self.transition(DeviceState::LowBattery);
                } else {
                    self.transition(DeviceState::Driving);
                }
            }
            DeviceState::Driving if !on => {
                self.parked_at = Some(now);
                self.transition(DeviceState::Parked);
            }
            DeviceState::Parked if on => {
                self.parked_at = None;
                self.transition(DeviceState::Driving);
            }
            // LowBattery and Offline latch until recovery; the scalar is
            // still tracked for reconstitution.
            _ => {}
        }

        Some(DomainEvent::new(if on {
            EventKind::IgnitionOn
        } else {
            EventKind::IgnitionOff
        }))
    }

    /// Motion edge. Repeated inputs with the same value are no-ops.
    pub fn motion(&mut self, moving: bool, now: Instant) -> Option<DomainEvent> {
        if self.motion == moving {
            return None;
        }
        self.motion = moving;

        match self.state {
            DeviceState::Driving if !moving => {
                self.parked_at = Some(now);
                self.transition(DeviceState::Parked);
            }
            DeviceState::Parked if moving => {
                self.parked_at = None;
                self.transition(DeviceState::Driving);
            }
            _ => {}
        }

        Some(DomainEvent::new(if moving {
            EventKind::MotionStart
        } else {
            EventKind::MotionStop
        }))
    }

    /// Battery sample. Emits `LowBattery` only on a downward crossing of
    /// the threshold; an upward crossing reconstitutes the state from the
    /// current ignition and motion inputs without emitting.
    pub fn battery_percent(&mut self, percent: f64, now: Instant) -> Option<DomainEvent> {
        let was_low = self.battery_low();
        self.battery_percent = percent;
        let is_low = self.battery_low();

        if !was_low && is_low {
            if self.state != DeviceState::Offline {
                self.transition(DeviceState::LowBattery);
            }
            return Some(DomainEvent::new(EventKind::LowBattery));
        }

        if was_low && !is_low && self.state == DeviceState::LowBattery {
            let next = self.reconstitute();
            if next == DeviceState::Parked {
                self.parked_at = Some(now);
            }
            self.transition(next);
        }

        None
    }

    /// Geofence membership report. Emits only on actual set-membership
    /// transitions, so `GeofenceEnter`/`GeofenceExit` strictly alternate
    /// per fence id.
    pub fn geofence(&mut self, inside: bool, id: &str) -> Option<DomainEvent> {
        if inside {
            if !self.inside.insert(id.to_string()) {
                return None;
            }
            Some(DomainEvent::with_extras(
                EventKind::GeofenceEnter,
                [("geofence_id", id.to_string())],
            ))
        } else {
            if !self.inside.remove(id) {
                return None;
            }
            Some(DomainEvent::with_extras(
                EventKind::GeofenceExit,
                [("geofence_id", id.to_string())],
            ))
        }
    }

    /// Speed sample. Emits on each strict upper crossing of the limit and
    /// stays latched until the measured speed returns to or below it.
    pub fn speed_sample(&mut self, measured_kph: f64, limit_kph: f64) -> Option<DomainEvent> {
        let over = measured_kph > limit_kph;
        if over && !self.speed_over_limit {
            self.speed_over_limit = true;
            return Some(DomainEvent::with_extras(
                EventKind::SpeedOverLimit,
                [
                    ("limit", format!("{limit_kph}")),
                    ("measured", format!("{measured_kph}")),
                ],
            ));
        }
        if !over {
            self.speed_over_limit = false;
        }
        None
    }

    /// Connectivity transitions drive `Offline` entry and recovery. No
    /// telemetry event is emitted; a lost link could not carry one anyway.
    pub fn set_connected(&mut self, connected: bool, now: Instant) {
        let was = self.connected;
        self.connected = connected;

        if was && !connected {
            self.parked_at = None;
            self.transition(DeviceState::Offline);
        } else if !was && connected && self.state == DeviceState::Offline {
            // LowBattery wins over reconstitution when the charge is low.
            let next = if self.battery_low() {
                DeviceState::LowBattery
            } else {
                self.reconstitute()
            };
            if next == DeviceState::Parked {
                self.parked_at = Some(now);
            }
            self.transition(next);
        }
    }

    /// Timer pass: expires the parking window (Parked → Idle after two
    /// minutes without motion or ignition).
    pub fn tick(&mut self, now: Instant) {
        if self.state == DeviceState::Parked {
            if let Some(parked_at) = self.parked_at {
                if now.duration_since(parked_at) >= PARKING_TIMEOUT {
                    self.parked_at = None;
                    self.transition(DeviceState::Idle);
                }
            }
        }
    }

    /// The state implied by the current inputs, used when leaving a
    /// latched state.
    fn reconstitute(&self) -> DeviceState {
        if self.battery_low() {
            DeviceState::LowBattery
        } else if self.ignition && self.motion {
            DeviceState::Driving
        } else if self.ignition || self.motion {
            DeviceState::Parked
        } else {
            DeviceState::Idle
        }
    }

    fn transition(&mut self, next: DeviceState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "device state transition");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    fn kinds(events: &[Option<DomainEvent>]) -> Vec<EventKind> {
        events
            .iter()
            .flatten()
            .map(|event| event.kind)
            .collect()
    }

    #[test]
    fn ignition_drives_idle_to_driving_and_back_through_parked() {
        let t0 = now();
        let mut machine = StateMachine::new();

        let on = machine.ignition(true, t0);
        assert_eq!(on.unwrap().kind, EventKind::IgnitionOn);
        assert_eq!(machine.state(), DeviceState::Driving);

        // repeated input is a no-op
        assert!(machine.ignition(true, t0).is_none());

        let off = machine.ignition(false, t0);
        assert_eq!(off.unwrap().kind, EventKind::IgnitionOff);
        assert_eq!(machine.state(), DeviceState::Parked);

        // parking expires to idle after two minutes
        machine.tick(t0 + PARKING_TIMEOUT - Duration::from_secs(1));
        assert_eq!(machine.state(), DeviceState::Parked);
        machine.tick(t0 + PARKING_TIMEOUT);
        assert_eq!(machine.state(), DeviceState::Idle);
    }

    #[test]
    fn motion_cancels_the_parking_timer() {
        let t0 = now();
        let mut machine = StateMachine::new();
        machine.ignition(true, t0);
        machine.motion(true, t0);
        assert_eq!(machine.state(), DeviceState::Driving);

        machine.motion(false, t0);
        assert_eq!(machine.state(), DeviceState::Parked);

        machine.motion(true, t0 + Duration::from_secs(30));
        assert_eq!(machine.state(), DeviceState::Driving);

        // the old timer no longer fires
        machine.tick(t0 + PARKING_TIMEOUT * 2);
        assert_eq!(machine.state(), DeviceState::Driving);
    }

    #[test]
    fn ignition_on_with_low_battery_goes_straight_to_low_battery() {
        let t0 = now();
        let mut machine = StateMachine::new();
        machine.battery_percent(10.0, t0);
        assert_eq!(machine.state(), DeviceState::LowBattery);

        let event = machine.ignition(true, t0);
        assert_eq!(event.unwrap().kind, EventKind::IgnitionOn);
        assert_eq!(machine.state(), DeviceState::LowBattery);
    }

    #[test]
    fn low_battery_latches_and_reemits_per_downward_crossing() {
        let t0 = now();
        let mut machine = StateMachine::new();
        machine.ignition(true, t0);
        machine.motion(true, t0);
        assert_eq!(machine.state(), DeviceState::Driving);

        // downward crossing: exactly one event
        let events = [
            machine.battery_percent(19.0, t0),
            machine.battery_percent(18.0, t0),
        ];
        assert_eq!(kinds(&events), vec![EventKind::LowBattery]);
        assert_eq!(machine.state(), DeviceState::LowBattery);

        // recovery reconstitutes driving (ignition on, motion true), no event
        assert!(machine.battery_percent(21.0, t0).is_none());
        assert_eq!(machine.state(), DeviceState::Driving);

        // a second crossing emits again
        let again = machine.battery_percent(19.5, t0);
        assert_eq!(again.unwrap().kind, EventKind::LowBattery);
        assert_eq!(machine.state(), DeviceState::LowBattery);
    }

    #[test]
    fn offline_reconstitutes_on_restore_and_low_battery_wins() {
        let t0 = now();
        let mut machine = StateMachine::new();
        machine.ignition(true, t0);
        machine.motion(true, t0);

        machine.set_connected(false, t0);
        assert_eq!(machine.state(), DeviceState::Offline);

        // inputs while offline still update the scalars
        machine.motion(false, t0);

        machine.set_connected(true, t0);
        assert_eq!(machine.state(), DeviceState::Parked);

        machine.set_connected(false, t0);
        machine.battery_percent(5.0, t0);
        machine.set_connected(true, t0);
        assert_eq!(machine.state(), DeviceState::LowBattery);
    }

    #[test]
    fn geofence_events_alternate_per_id() {
        let mut machine = StateMachine::new();

        let enter = machine.geofence(true, "depot").unwrap();
        assert_eq!(enter.kind, EventKind::GeofenceEnter);
        assert_eq!(
            enter.extras.get("geofence_id"),
            Some(&Some("depot".to_string()))
        );

        // repeated membership reports don't re-trigger
        assert!(machine.geofence(true, "depot").is_none());
        // exit of a fence we never entered is a no-op
        assert!(machine.geofence(false, "mall").is_none());

        let exit = machine.geofence(false, "depot").unwrap();
        assert_eq!(exit.kind, EventKind::GeofenceExit);
        assert!(machine.geofence(false, "depot").is_none());
    }

    #[test]
    fn speed_over_limit_fires_on_each_strict_upper_crossing() {
        let mut machine = StateMachine::new();

        assert!(machine.speed_sample(90.0, 90.0).is_none());

        let first = machine.speed_sample(95.0, 90.0).unwrap();
        assert_eq!(first.kind, EventKind::SpeedOverLimit);
        assert_eq!(first.extras.get("limit"), Some(&Some("90".to_string())));
        assert_eq!(first.extras.get("measured"), Some(&Some("95".to_string())));

        // latched while over
        assert!(machine.speed_sample(97.0, 90.0).is_none());

        // back under, then a second crossing
        assert!(machine.speed_sample(88.0, 90.0).is_none());
        assert!(machine.speed_sample(91.0, 90.0).is_some());
    }

    #[test]
    fn deterministic_for_identical_input_sequences() {
        let t0 = now();
        let run = |t0: Instant| {
            let mut machine = StateMachine::new();
            let events = vec![
                machine.ignition(true, t0),
                machine.motion(true, t0),
                machine.battery_percent(15.0, t0),
                machine.battery_percent(25.0, t0),
                machine.geofence(true, "a"),
                machine.motion(false, t0),
            ];
            (machine.state(), kinds(&events))
        };

        assert_eq!(run(t0), run(t0));
    }
}
