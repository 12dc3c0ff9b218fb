/*
The transport port.

The core never talks to a broker library directly; it drives an object
implementing [`Transport`]. Connects, publishes and subscriptions are
non-blocking attempts that report acceptance, and everything the broker
pushes back (connection transitions, inbound messages) is drained from the
transport with [`Transport::pump`] on the driver thread. An implementation
backed by a threaded client library is expected to marshal its callbacks
into a bounded inbox and empty it on `pump`.
*/

use std::path::PathBuf;

pub mod emulator;
pub mod mock;

pub use emulator::CloudEmulator;
pub use mock::MockTransport;

/// Message delivery guarantee requested from the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// TLS material bundle for mutual-auth connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub trust_anchor_path: PathBuf,
    pub verify_server: bool,
}

/// How the client authenticates to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// Token or shared-key authentication; the username travels in
    /// [`ConnectOptions::username`].
    Password(String),
    Tls(TlsMaterial),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Protocol-level username, e.g. the api-version string some backends
    /// require alongside certificate auth.
    pub username: Option<String>,
    pub credentials: Credentials,
}

/// An inbound publication delivered by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retained: false,
        }
    }

    /// Payload interpreted as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Everything a transport can report back to the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(Message),
}

/// A topic-addressed publish/subscribe channel.
///
/// All methods are non-blocking. `connect` and `publish` return whether the
/// operation was *accepted*; the outcome of a connect attempt arrives later
/// as a [`TransportEvent::Connected`] or [`TransportEvent::Disconnected`].
pub trait Transport {
    fn connect(&mut self, opts: ConnectOptions) -> bool;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retained: bool) -> bool;
    fn subscribe(&mut self, filter: &str, qos: QoS) -> bool;
    fn unsubscribe(&mut self, filter: &str) -> bool;

    /// Drain pending events accumulated since the last pump.
    fn pump(&mut self) -> Vec<TransportEvent>;
}

/// Produces a fresh transport for each phase of the connection lifecycle
/// (one for provisioning, one per hub attachment).
pub trait TransportFactory {
    fn open(&mut self) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: FnMut() -> Box<dyn Transport>,
{
    fn open(&mut self) -> Box<dyn Transport> {
        self()
    }
}
