//! The telemetry event model and its JSON wire mapping.
//!
//! An event is created once by the telemetry pipeline, serialized and
//! either published or queued; it is never mutated afterwards. Identity is
//! `(device_id, sequence)` with `sequence` strictly monotonic from 1.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What happened. Serialized in kebab-case (`ignition-on`, `speed-over-limit`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Heartbeat,
    IgnitionOn,
    IgnitionOff,
    MotionStart,
    MotionStop,
    GeofenceEnter,
    GeofenceExit,
    SpeedOverLimit,
    LowBattery,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Heartbeat => "heartbeat",
            EventKind::IgnitionOn => "ignition-on",
            EventKind::IgnitionOff => "ignition-off",
            EventKind::MotionStart => "motion-start",
            EventKind::MotionStop => "motion-stop",
            EventKind::GeofenceEnter => "geofence-enter",
            EventKind::GeofenceExit => "geofence-exit",
            EventKind::SpeedOverLimit => "speed-over-limit",
            EventKind::LowBattery => "low-battery",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WGS84 position, decimal degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(rename = "acc")]
    pub accuracy: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    #[serde(rename = "pct")]
    pub percent: f64,
    pub voltage: f64,
}

impl Default for Battery {
    fn default() -> Self {
        Self {
            percent: 100.0,
            voltage: 4.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub rssi: i32,
    /// Radio access technology, e.g. "LTE".
    pub rat: String,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            rssi: -70,
            rat: "LTE".to_string(),
        }
    }
}

/// Ordered string extras; a `None` value serializes as JSON null.
pub type Extras = BTreeMap<String, Option<String>>;

/// A fully assembled telemetry envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub device_id: String,
    /// ISO-8601 UTC, millisecond precision.
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub event_type: EventKind,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(rename = "loc")]
    pub location: Location,
    pub speed_kph: f64,
    pub heading: f64,
    pub battery: Battery,
    pub network: Network,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: Extras,
}

pub fn encode(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

pub fn decode(payload: &[u8]) -> Result<Event, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Event {
        Event {
            device_id: "d1".into(),
            timestamp: "2024-01-01T00:00:01.500Z".into(),
            event_type: EventKind::SpeedOverLimit,
            sequence: 3,
            location: Location {
                lat: -26.2041,
                lon: 28.0473,
                alt: 1720.0,
                accuracy: 12.5,
            },
            speed_kph: 95.0,
            heading: 182.5,
            battery: Battery {
                percent: 87.0,
                voltage: 4.05,
            },
            network: Network {
                rssi: -72,
                rat: "LTE".into(),
            },
            extras: Extras::from([
                ("limit".into(), Some("90".into())),
                ("measured".into(), Some("95".into())),
            ]),
        }
    }

    #[test]
    fn serializes_the_wire_field_mapping() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            value,
            json!({
                "deviceId": "d1",
                "ts": "2024-01-01T00:00:01.500Z",
                "eventType": "speed-over-limit",
                "seq": 3,
                "loc": {"lat": -26.2041, "lon": 28.0473, "alt": 1720.0, "acc": 12.5},
                "speedKph": 95.0,
                "heading": 182.5,
                "battery": {"pct": 87.0, "voltage": 4.05},
                "network": {"rssi": -72, "rat": "LTE"},
                "extras": {"limit": "90", "measured": "95"},
            })
        );
    }

    #[test]
    fn empty_extras_are_omitted_and_null_extras_roundtrip() {
        let mut event = sample();
        event.extras.clear();
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("extras").is_none());

        event.extras.insert("geofence_id".into(), None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["extras"]["geofence_id"], serde_json::Value::Null);
    }

    #[test]
    fn json_roundtrip_preserves_events() {
        let event = sample();
        let decoded = decode(&encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn kebab_case_kind_strings() {
        assert_eq!(
            serde_json::to_value(EventKind::IgnitionOn).unwrap(),
            json!("ignition-on")
        );
        assert_eq!(
            serde_json::from_value::<EventKind>(json!("geofence-exit")).unwrap(),
            EventKind::GeofenceExit
        );
        assert_eq!(EventKind::LowBattery.as_str(), "low-battery");
    }
}
