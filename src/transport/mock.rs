//! Scriptable in-memory transport used by the test-suite.
//!
//! The transport hands out cheap clones sharing one inner state so a test
//! can keep a handle after moving the "real" one into the orchestrator:
//! inject inbound messages, sever and restore the link, and inspect what
//! the core published, in order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{ConnectOptions, Message, QoS, Transport, TransportEvent};

/// Chronological record of the operations the core performed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Connect(String),
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Publish(String),
}

#[derive(Default)]
struct Inner {
    connected: bool,
    /// Whether `connect` reports the attempt as accepted.
    accept_connect: bool,
    /// Whether an accepted connect yields a `Connected` event on the next pump.
    complete_connect: bool,
    fail_publish: bool,
    fail_subscribe: bool,
    last_connect: Option<ConnectOptions>,
    subscriptions: Vec<String>,
    published: Vec<Message>,
    ops: Vec<Op>,
    inbox: VecDeque<TransportEvent>,
}

#[derive(Clone)]
pub struct MockTransport(Rc<RefCell<Inner>>);

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Inner {
            accept_connect: true,
            complete_connect: true,
            ..Default::default()
        })))
    }

    /// Boxed clone, convenient for transport factories.
    pub fn handle(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn set_accept_connect(&self, accept: bool) {
        self.0.borrow_mut().accept_connect = accept;
    }

    /// When disabled, an accepted connect stays pending until
    /// [`MockTransport::complete_connect`] or [`MockTransport::refuse_connect`].
    pub fn set_complete_connect(&self, complete: bool) {
        self.0.borrow_mut().complete_connect = complete;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.0.borrow_mut().fail_publish = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.0.borrow_mut().fail_subscribe = fail;
    }

    /// Resolve a pending connect attempt successfully.
    pub fn complete_connect(&self) {
        let mut inner = self.0.borrow_mut();
        inner.connected = true;
        inner.inbox.push_back(TransportEvent::Connected);
    }

    /// Resolve a pending connect attempt as failed.
    pub fn refuse_connect(&self, reason: &str) {
        let mut inner = self.0.borrow_mut();
        inner.connected = false;
        inner.inbox.push_back(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Sever an established link; the core observes it on the next pump.
    pub fn drop_link(&self, reason: &str) {
        let mut inner = self.0.borrow_mut();
        inner.connected = false;
        inner.inbox.push_back(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Deliver an inbound publication.
    pub fn inject_message(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.0
            .borrow_mut()
            .inbox
            .push_back(TransportEvent::Message(Message::new(topic, payload)));
    }

    pub fn is_link_up(&self) -> bool {
        self.0.borrow().connected
    }

    pub fn last_connect(&self) -> Option<ConnectOptions> {
        self.0.borrow().last_connect.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.0.borrow().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Message> {
        self.0.borrow().published.clone()
    }

    pub fn take_published(&self) -> Vec<Message> {
        std::mem::take(&mut self.0.borrow_mut().published)
    }

    /// Chronological operation log, for ordering assertions.
    pub fn ops(&self) -> Vec<Op> {
        self.0.borrow().ops.clone()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, opts: ConnectOptions) -> bool {
        let mut inner = self.0.borrow_mut();
        inner.ops.push(Op::Connect(opts.host.clone()));
        inner.last_connect = Some(opts);
        if !inner.accept_connect {
            return false;
        }
        if inner.complete_connect {
            inner.connected = true;
            inner.inbox.push_back(TransportEvent::Connected);
        }
        true
    }

    fn disconnect(&mut self) {
        let mut inner = self.0.borrow_mut();
        inner.connected = false;
        inner.ops.push(Op::Disconnect);
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retained: bool) -> bool {
        let mut inner = self.0.borrow_mut();
        if !inner.connected || inner.fail_publish {
            return false;
        }
        inner.ops.push(Op::Publish(topic.to_string()));
        inner.published.push(Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retained,
        });
        true
    }

    fn subscribe(&mut self, filter: &str, _qos: QoS) -> bool {
        let mut inner = self.0.borrow_mut();
        if !inner.connected || inner.fail_subscribe {
            return false;
        }
        inner.ops.push(Op::Subscribe(filter.to_string()));
        if !inner.subscriptions.iter().any(|f| f == filter) {
            inner.subscriptions.push(filter.to_string());
        }
        true
    }

    fn unsubscribe(&mut self, filter: &str) -> bool {
        let mut inner = self.0.borrow_mut();
        if !inner.connected {
            return false;
        }
        inner.ops.push(Op::Unsubscribe(filter.to_string()));
        inner.subscriptions.retain(|f| f != filter);
        true
    }

    fn pump(&mut self) -> Vec<TransportEvent> {
        self.0.borrow_mut().inbox.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_operations_in_order() {
        let mock = MockTransport::new();
        let mut transport = mock.handle();

        assert!(transport.connect(ConnectOptions {
            host: "h".into(),
            port: 8883,
            client_id: "c".into(),
            username: None,
            credentials: super::super::Credentials::Password("p".into()),
        }));
        assert_eq!(transport.pump(), vec![TransportEvent::Connected]);

        assert!(transport.subscribe("a/#", QoS::AtLeastOnce));
        assert!(transport.publish("a/b", b"x", QoS::AtLeastOnce, false));

        assert_eq!(
            mock.ops(),
            vec![
                Op::Connect("h".into()),
                Op::Subscribe("a/#".into()),
                Op::Publish("a/b".into()),
            ]
        );
    }

    #[test]
    fn rejects_publish_while_down() {
        let mock = MockTransport::new();
        let mut transport = mock.handle();
        assert!(!transport.publish("a", b"x", QoS::AtLeastOnce, false));

        mock.complete_connect();
        let _ = transport.pump();
        assert!(transport.publish("a", b"x", QoS::AtLeastOnce, false));

        mock.drop_link("carrier lost");
        assert!(!transport.publish("a", b"x", QoS::AtLeastOnce, false));
        assert!(matches!(
            transport.pump().as_slice(),
            [TransportEvent::Disconnected { .. }]
        ));
    }
}
