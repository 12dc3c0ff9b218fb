/*
The connection orchestrator.

Drives the device from Disconnected to Connected in two phases: a
provisioning conversation on a dedicated transport, then an authenticated
hub attachment reusing the same credential material. Once attached it keeps
the session alive against transient faults with exponential backoff,
re-establishing every subscription before any queued publish is retried,
and demultiplexes inbound messages by topic prefix.

Adapters never hold the hub transport; they publish and subscribe through
the narrow [`Publish`] mediator and receive their inbound traffic from the
event stream returned by [`Uplink::tick`].
*/

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LegacyConfig, ProvisioningConfig};
use crate::policy::{ExponentialBackoff, RetryPolicy as _};
use crate::provisioning::{Assignment, Provisioner};
use crate::topic;
use crate::transport::{
    ConnectOptions, Credentials, Message, QoS, TlsMaterial, Transport, TransportEvent,
    TransportFactory,
};

/// Protocol version sent in the hub connect username.
const HUB_API_VERSION: &str = "2021-04-12";

pub const HUB_PORT: u16 = 8883;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Provisioning,
    ConnectingToHub,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Provisioning => "provisioning",
            ConnectionState::ConnectingToHub => "connecting-to-hub",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous rejections from [`Uplink::connect`]. These are validation
/// failures and are never retried.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection already in progress or established")]
    Busy,

    #[error("credential material not found: {}", .0.display())]
    MissingCredential(PathBuf),

    #[error("access token is empty")]
    EmptyToken,

    #[error("neither provisioning nor legacy credentials configured")]
    NoCredentials,
}

/// Ready-to-use legacy hub access. The token comes from the credential
/// provider; the orchestrator does not mint tokens itself.
#[derive(Clone, Debug)]
pub struct LegacyAccess {
    pub hub_host: String,
    pub device_id: String,
    pub sas_token: String,
}

impl LegacyAccess {
    pub fn new(config: &LegacyConfig, sas_token: String) -> Self {
        Self {
            hub_host: config.hub_host.clone(),
            device_id: config.device_id.clone(),
            sas_token,
        }
    }
}

/// Connection-time device configuration: provisioning preferred, legacy
/// shared-key access as fallback.
#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    pub provisioning: Option<ProvisioningConfig>,
    pub legacy: Option<LegacyAccess>,
}

/// What the orchestrator reports back to the driver each tick.
#[derive(Clone, Debug)]
pub enum UplinkEvent {
    /// First attachment completed; the session is live.
    Connected(Assignment),
    /// An established session dropped; reconnection is scheduled.
    ConnectionLost { reason: String },
    /// A dropped session was re-established and re-subscribed.
    Reconnected,
    /// Terminal failure; operator action required.
    Failed(String),
    /// Inbound twin control-plane message.
    Twin(Message),
    /// Inbound device-bound message (commands and anything unrecognized).
    Command(Message),
}

/// Narrow mediator surface exposed to the twin adapter and the telemetry
/// pipeline.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retained: bool) -> bool;
    fn subscribe(&mut self, filter: &str, qos: QoS) -> bool;
    fn is_connected(&self) -> bool;
}

pub struct Uplink {
    factory: Box<dyn TransportFactory>,
    state: ConnectionState,
    provisioner: Option<Provisioner>,
    hub: Option<Box<dyn Transport>>,
    hub_opts: Option<ConnectOptions>,
    config: DeviceConfig,
    assignment: Option<Assignment>,
    subscriptions: Vec<(String, QoS)>,
    backoff: ExponentialBackoff,
    reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
    attached_once: bool,
    pending: Vec<UplinkEvent>,
}

impl Uplink {
    pub fn new(factory: Box<dyn TransportFactory>) -> Self {
        Self {
            factory,
            state: ConnectionState::Disconnected,
            provisioner: None,
            hub: None,
            hub_opts: None,
            config: DeviceConfig::default(),
            assignment: None,
            subscriptions: Vec::new(),
            backoff: ExponentialBackoff {
                max_attempts: MAX_RECONNECT_ATTEMPTS,
                ..Default::default()
            },
            reconnect_attempts: 0,
            next_reconnect_at: None,
            attached_once: false,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.device_id.as_str())
    }

    pub fn assigned_hub(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.hub.as_str())
    }

    /// Begins the connection lifecycle. Rejected while any connection is
    /// in progress or established; `disconnect` first.
    pub fn connect(&mut self, config: DeviceConfig, now: Instant) -> Result<(), ConnectError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ConnectError::Busy);
        }

        if let Some(provisioning) = config.provisioning.clone() {
            for path in [
                &provisioning.cert_path,
                &provisioning.key_path,
                &provisioning.trust_anchor_path,
            ] {
                if !fs::exists(path).unwrap_or(false) {
                    return Err(ConnectError::MissingCredential(path.clone()));
                }
            }

            self.config = config;
            self.state = ConnectionState::Provisioning;
            self.provisioner = Some(Provisioner::start(self.factory.open(), &provisioning, now));
            return Ok(());
        }

        if let Some(legacy) = &config.legacy {
            if legacy.sas_token.is_empty() {
                return Err(ConnectError::EmptyToken);
            }
            let assignment = Assignment {
                hub: legacy.hub_host.clone(),
                device_id: legacy.device_id.clone(),
            };
            info!(hub = %assignment.hub, device_id = %assignment.device_id, "using legacy hub access");
            self.config = config;
            self.begin_attachment(assignment);
            return Ok(());
        }

        Err(ConnectError::NoCredentials)
    }

    /// Idempotent teardown: cancels in-flight provisioning, closes the hub
    /// session and clears the assignment.
    pub fn disconnect(&mut self) {
        if let Some(provisioner) = &mut self.provisioner {
            provisioner.cancel();
        }
        self.provisioner = None;

        if let Some(hub) = &mut self.hub {
            hub.disconnect();
        }
        self.hub = None;
        self.hub_opts = None;

        self.state = ConnectionState::Disconnected;
        self.assignment = None;
        self.subscriptions.clear();
        self.reconnect_attempts = 0;
        self.next_reconnect_at = None;
        self.attached_once = false;
        self.pending.clear();
    }

    /// Unsubscribes on the hub and forgets the filter for reconnects.
    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.subscriptions.retain(|(f, _)| f != filter);
        match &mut self.hub {
            Some(hub) => hub.unsubscribe(filter),
            None => false,
        }
    }

    /// Pumps the active transport and drives the lifecycle.
    pub fn tick(&mut self, now: Instant) -> Vec<UplinkEvent> {
        let mut events = std::mem::take(&mut self.pending);

        match self.state {
            ConnectionState::Provisioning => {
                if let Some(provisioner) = &mut self.provisioner {
                    if let Some(outcome) = provisioner.tick(now) {
                        self.provisioner = None;
                        match outcome {
                            Ok(assignment) => {
                                self.begin_attachment(assignment);
                                events.append(&mut self.pending);
                            }
                            Err(err) => {
                                self.state = ConnectionState::Failed;
                                events.push(UplinkEvent::Failed(format!(
                                    "provisioning failed: {err}"
                                )));
                            }
                        }
                    }
                }
            }
            ConnectionState::ConnectingToHub | ConnectionState::Connected => {
                self.tick_hub(now, &mut events);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        events
    }

    fn begin_attachment(&mut self, assignment: Assignment) {
        self.state = ConnectionState::ConnectingToHub;

        let username = format!(
            "{}/{}/?api-version={HUB_API_VERSION}",
            assignment.hub, assignment.device_id
        );
        let credentials = if let Some(provisioning) = &self.config.provisioning {
            Credentials::Tls(TlsMaterial {
                cert_path: provisioning.cert_path.clone(),
                key_path: provisioning.key_path.clone(),
                trust_anchor_path: provisioning.trust_anchor_path.clone(),
                verify_server: provisioning.verify_server,
            })
        } else if let Some(legacy) = &self.config.legacy {
            Credentials::Password(legacy.sas_token.clone())
        } else {
            // connect() guarantees one of the two
            self.state = ConnectionState::Failed;
            self.pending
                .push(UplinkEvent::Failed("no credentials for hub attachment".into()));
            return;
        };

        let opts = ConnectOptions {
            host: assignment.hub.clone(),
            port: HUB_PORT,
            client_id: assignment.device_id.clone(),
            username: Some(username),
            credentials,
        };

        info!(hub = %assignment.hub, device_id = %assignment.device_id, "attaching to hub");
        self.assignment = Some(assignment);

        let mut hub = self.factory.open();
        let accepted = hub.connect(opts.clone());
        self.hub = Some(hub);
        self.hub_opts = Some(opts);

        if !accepted {
            self.state = ConnectionState::Failed;
            self.pending.push(UplinkEvent::Failed(
                "failed to initiate connection to hub".into(),
            ));
        }
    }

    fn tick_hub(&mut self, now: Instant, events: &mut Vec<UplinkEvent>) {
        self.pump_hub(now, events);

        // reconnection attempt, if one is due
        if self.state == ConnectionState::ConnectingToHub {
            if let Some(due) = self.next_reconnect_at {
                if now >= due && self.attempt_reconnect(now, events) {
                    // pick up the attempt's outcome without waiting a tick
                    self.pump_hub(now, events);
                }
            }
        }
    }

    fn pump_hub(&mut self, now: Instant, events: &mut Vec<UplinkEvent>) {
        let transport_events = match &mut self.hub {
            Some(hub) => hub.pump(),
            None => return,
        };

        for event in transport_events {
            match event {
                TransportEvent::Connected => self.on_hub_connected(events),
                TransportEvent::Disconnected { reason } => {
                    self.on_hub_disconnected(reason, now, events);
                }
                TransportEvent::Message(message) => {
                    if message.topic.starts_with(topic::TWIN_PREFIX) {
                        events.push(UplinkEvent::Twin(message));
                    } else if message.topic.starts_with(topic::PROVISIONING_RESPONSE_PREFIX) {
                        debug!(topic = %message.topic, "ignoring stray provisioning message on hub session");
                    } else {
                        events.push(UplinkEvent::Command(message));
                    }
                }
            }
        }
    }

    fn on_hub_connected(&mut self, events: &mut Vec<UplinkEvent>) {
        let Some(assignment) = self.assignment.clone() else {
            return;
        };

        // The device-bound command subscription is always first so the
        // control channel is live before anything else.
        let command_filter = topic::commands(&assignment.device_id);
        if !self.subscriptions.iter().any(|(f, _)| f == &command_filter) {
            self.subscriptions.insert(0, (command_filter, QoS::AtLeastOnce));
        }

        // All prior subscriptions are re-established before the caller gets
        // to flush any queued publishes.
        if let Some(hub) = &mut self.hub {
            for (filter, qos) in &self.subscriptions {
                if !hub.subscribe(filter, *qos) {
                    warn!(filter = %filter, "subscribe failed, will retry on next connect");
                }
            }
        }

        self.reconnect_attempts = 0;
        self.next_reconnect_at = None;
        self.state = ConnectionState::Connected;

        if self.attached_once {
            info!(hub = %assignment.hub, "hub session re-established");
            events.push(UplinkEvent::Reconnected);
        } else {
            self.attached_once = true;
            info!(hub = %assignment.hub, device_id = %assignment.device_id, "connected to hub");
            events.push(UplinkEvent::Connected(assignment));
        }
    }

    fn on_hub_disconnected(&mut self, reason: String, now: Instant, events: &mut Vec<UplinkEvent>) {
        if !self.attached_once {
            // failure during the initial attachment is terminal
            self.state = ConnectionState::Failed;
            events.push(UplinkEvent::Failed(format!(
                "failed to connect to hub: {reason}"
            )));
            return;
        }

        if self.state == ConnectionState::Connected {
            warn!(reason = %reason, "hub session lost");
            self.state = ConnectionState::ConnectingToHub;
            events.push(UplinkEvent::ConnectionLost { reason });
        }

        self.next_reconnect_at = Some(now + self.backoff.backoff(self.reconnect_attempts + 1));
    }

    fn attempt_reconnect(&mut self, now: Instant, events: &mut Vec<UplinkEvent>) -> bool {
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            warn!("max reconnection attempts reached, giving up");
            self.state = ConnectionState::Failed;
            self.next_reconnect_at = None;
            events.push(UplinkEvent::Failed("max reconnection attempts reached".into()));
            return false;
        }

        self.reconnect_attempts += 1;
        info!(attempt = self.reconnect_attempts, "attempting hub reconnection");

        let accepted = match (&mut self.hub, &self.hub_opts) {
            (Some(hub), Some(opts)) => hub.connect(opts.clone()),
            _ => false,
        };

        if accepted {
            // outcome arrives as a Connected or Disconnected event
            self.next_reconnect_at = None;
        } else {
            self.next_reconnect_at = Some(now + self.backoff.backoff(self.reconnect_attempts + 1));
        }
        accepted
    }
}

impl Publish for Uplink {
    /// Valid only while connected. Topics outside the device namespace are
    /// prefixed with the telemetry topic.
    fn publish(&mut self, topic_name: &str, payload: &[u8], qos: QoS, retained: bool) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let Some(assignment) = &self.assignment else {
            return false;
        };

        let full_topic = if topic_name.starts_with("devices/") {
            topic_name.to_string()
        } else {
            format!("{}{topic_name}", topic::telemetry(&assignment.device_id))
        };

        match &mut self.hub {
            Some(hub) => hub.publish(&full_topic, payload, qos, retained),
            None => false,
        }
    }

    /// Valid only while connected. Remembered for re-subscription after a
    /// reconnect.
    fn subscribe(&mut self, filter: &str, qos: QoS) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        if !self.subscriptions.iter().any(|(f, _)| f == filter) {
            self.subscriptions.push((filter.to_string(), qos));
        }
        match &mut self.hub {
            Some(hub) => hub.subscribe(filter, qos),
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.hub.as_ref().is_some_and(|hub| hub.is_connected())
    }
}
