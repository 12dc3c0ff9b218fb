//! In-process cloud emulator.
//!
//! A scripted peer implementing the transport port so the binary (and the
//! end-to-end tests) can run the full provisioning, telemetry and twin
//! conversation without a broker. The role is inferred from the connect
//! target: a connection to the configured hub hostname behaves as the hub,
//! anything else as the provisioning service.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::debug;

use crate::topic;

use super::{ConnectOptions, Message, QoS, Transport, TransportEvent};

#[derive(Clone, Debug)]
pub struct EmulatorSettings {
    /// Hub hostname handed out by the provisioning conversation.
    pub assigned_hub: String,
    /// Device id assigned at provisioning; defaults to the registration id.
    pub device_id: Option<String>,
    pub operation_id: String,
    /// Status polls answered with "assigning" before the assignment lands.
    pub polls_until_assigned: u32,
    /// Desired twin document served on GET.
    pub desired: Value,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            assigned_hub: "hub.waymark.local".to_string(),
            device_id: None,
            operation_id: "op-1".to_string(),
            polls_until_assigned: 1,
            desired: json!({
                "$version": 1,
                "config": {
                    "reporting_interval_sec": 60,
                }
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Provisioning,
    Hub,
}

struct Inner {
    settings: EmulatorSettings,
    role: Option<Role>,
    connected: bool,
    client_id: String,
    subscriptions: Vec<String>,
    inbox: VecDeque<TransportEvent>,
    polls_seen: u32,
    telemetry_received: Vec<Message>,
}

/// Cheaply cloneable handle; clones share the same peer state.
#[derive(Clone)]
pub struct CloudEmulator(Rc<RefCell<Inner>>);

impl CloudEmulator {
    pub fn new(settings: EmulatorSettings) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            settings,
            role: None,
            connected: false,
            client_id: String::new(),
            subscriptions: Vec::new(),
            inbox: VecDeque::new(),
            polls_seen: 0,
            telemetry_received: Vec::new(),
        })))
    }

    pub fn handle(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    /// Telemetry envelopes the emulated hub received.
    pub fn telemetry_received(&self) -> Vec<Message> {
        self.0.borrow().telemetry_received.clone()
    }
}

impl Inner {
    fn deliver(&mut self, topic: &str, payload: String) {
        if self
            .subscriptions
            .iter()
            .any(|filter| topic::matches_filter(topic, filter))
        {
            self.inbox
                .push_back(TransportEvent::Message(Message::new(topic, payload)));
        } else {
            debug!(topic = %topic, "emulator response dropped, no matching subscription");
        }
    }

    fn assigned_device_id(&self) -> String {
        self.settings
            .device_id
            .clone()
            .unwrap_or_else(|| self.client_id.clone())
    }

    fn on_provisioning_publish(&mut self, publish_topic: &str) {
        if publish_topic == topic::REGISTRATION_PUT {
            let body = json!({
                "operationId": self.settings.operation_id,
                "status": "assigning",
            });
            self.deliver("$dps/registrations/res/202/?$rid=1", body.to_string());
        } else if publish_topic.starts_with("$dps/registrations/GET/") {
            self.polls_seen += 1;
            let body = if self.polls_seen >= self.settings.polls_until_assigned {
                json!({
                    "status": "assigned",
                    "assignedHub": self.settings.assigned_hub,
                    "deviceId": self.assigned_device_id(),
                })
            } else {
                json!({
                    "operationId": self.settings.operation_id,
                    "status": "assigning",
                })
            };
            self.deliver("$dps/registrations/res/200/?$rid=2", body.to_string());
        }
    }

    fn on_hub_publish(&mut self, publish_topic: &str, payload: &[u8]) {
        if publish_topic.starts_with("$iothub/twin/GET/") {
            let rid = topic::request_id(publish_topic).unwrap_or("0");
            let body = json!({ "desired": self.settings.desired });
            let response_topic = format!("$iothub/twin/res/200/?$rid={rid}");
            self.deliver(&response_topic, body.to_string());
        } else if publish_topic.starts_with("$iothub/twin/PATCH/properties/reported/") {
            let rid = topic::request_id(publish_topic).unwrap_or("0");
            let response_topic = format!("$iothub/twin/res/204/?$rid={rid}");
            self.deliver(&response_topic, String::new());
        } else if publish_topic.starts_with("devices/") {
            debug!(topic = %publish_topic, bytes = payload.len(), "telemetry received");
            self.telemetry_received
                .push(Message::new(publish_topic, payload.to_vec()));
        }
    }
}

impl Transport for CloudEmulator {
    fn connect(&mut self, opts: ConnectOptions) -> bool {
        let mut inner = self.0.borrow_mut();
        let role = if opts.host == inner.settings.assigned_hub {
            Role::Hub
        } else {
            Role::Provisioning
        };
        debug!(host = %opts.host, ?role, "emulator connection");

        inner.role = Some(role);
        inner.client_id = opts.client_id;
        inner.connected = true;
        inner.inbox.push_back(TransportEvent::Connected);
        true
    }

    fn disconnect(&mut self) {
        let mut inner = self.0.borrow_mut();
        inner.connected = false;
        inner.subscriptions.clear();
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn publish(&mut self, publish_topic: &str, payload: &[u8], _qos: QoS, _retained: bool) -> bool {
        let mut inner = self.0.borrow_mut();
        if !inner.connected {
            return false;
        }

        match inner.role {
            Some(Role::Provisioning) => inner.on_provisioning_publish(publish_topic),
            Some(Role::Hub) => inner.on_hub_publish(publish_topic, payload),
            None => return false,
        }
        true
    }

    fn subscribe(&mut self, filter: &str, _qos: QoS) -> bool {
        let mut inner = self.0.borrow_mut();
        if !inner.connected {
            return false;
        }
        if !inner.subscriptions.iter().any(|f| f == filter) {
            inner.subscriptions.push(filter.to_string());
        }
        true
    }

    fn unsubscribe(&mut self, filter: &str) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.subscriptions.retain(|f| f != filter);
        inner.connected
    }

    fn pump(&mut self) -> Vec<TransportEvent> {
        self.0.borrow_mut().inbox.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Credentials;

    fn connect(emulator: &mut CloudEmulator, host: &str, client_id: &str) {
        assert!(emulator.connect(ConnectOptions {
            host: host.into(),
            port: 8883,
            client_id: client_id.into(),
            username: None,
            credentials: Credentials::Password("x".into()),
        }));
        assert!(matches!(
            emulator.pump().as_slice(),
            [TransportEvent::Connected]
        ));
    }

    #[test]
    fn provisioning_role_walks_the_assignment_conversation() {
        let mut emulator = CloudEmulator::new(EmulatorSettings {
            polls_until_assigned: 2,
            ..Default::default()
        });
        connect(&mut emulator, "provisioning.example", "imei-1");

        emulator.subscribe(topic::PROVISIONING_RESPONSE_FILTER, QoS::AtLeastOnce);
        emulator.publish(topic::REGISTRATION_PUT, b"{}", QoS::AtLeastOnce, false);

        let events = emulator.pump();
        let [TransportEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message, got {events:?}");
        };
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["status"], "assigning");
        assert_eq!(body["operationId"], "op-1");

        // first poll still assigning, second assigns
        emulator.publish(
            &topic::registration_status_get("op-1"),
            b"",
            QoS::AtLeastOnce,
            false,
        );
        let events = emulator.pump();
        let [TransportEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message, got {events:?}");
        };
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["status"], "assigning");

        emulator.publish(
            &topic::registration_status_get("op-1"),
            b"",
            QoS::AtLeastOnce,
            false,
        );
        let events = emulator.pump();
        let [TransportEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message, got {events:?}");
        };
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["status"], "assigned");
        assert_eq!(body["assignedHub"], "hub.waymark.local");
        assert_eq!(body["deviceId"], "imei-1");
    }

    #[test]
    fn hub_role_answers_twin_get_and_reported_patch() {
        let mut emulator = CloudEmulator::new(EmulatorSettings::default());
        connect(&mut emulator, "hub.waymark.local", "d1");

        emulator.subscribe(topic::TWIN_RESPONSE_FILTER, QoS::AtMostOnce);
        emulator.publish(&topic::twin_get(1), b"", QoS::AtMostOnce, false);

        let events = emulator.pump();
        let [TransportEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message, got {events:?}");
        };
        assert_eq!(message.topic, "$iothub/twin/res/200/?$rid=1");
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["desired"]["$version"], 1);

        emulator.publish(&topic::twin_reported_patch(2), b"{}", QoS::AtMostOnce, false);
        let events = emulator.pump();
        let [TransportEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message, got {events:?}");
        };
        assert_eq!(message.topic, "$iothub/twin/res/204/?$rid=2");
    }

    #[test]
    fn hub_role_collects_telemetry() {
        let mut emulator = CloudEmulator::new(EmulatorSettings::default());
        connect(&mut emulator, "hub.waymark.local", "d1");

        emulator.publish(
            "devices/d1/messages/events/",
            b"{\"seq\":1}",
            QoS::AtLeastOnce,
            false,
        );
        assert_eq!(emulator.telemetry_received().len(), 1);
    }

    #[test]
    fn responses_require_a_matching_subscription() {
        let mut emulator = CloudEmulator::new(EmulatorSettings::default());
        connect(&mut emulator, "provisioning.example", "imei-1");

        // no subscription yet: the response is dropped
        emulator.publish(topic::REGISTRATION_PUT, b"{}", QoS::AtLeastOnce, false);
        assert!(emulator.pump().is_empty());
    }
}
