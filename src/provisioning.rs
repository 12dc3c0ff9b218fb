//! The provisioning protocol engine.
//!
//! Runs the registration/assignment conversation against the provisioning
//! service on a dedicated transport: connect, subscribe to the response
//! wildcard, publish a registration request, poll the operation status
//! until the service assigns a hub, and report the outcome exactly once.
//! The engine is driven by `tick(now)`; completion is the first `Some`
//! returned from it.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ProvisioningConfig;
use crate::topic;
use crate::transport::{
    ConnectOptions, Credentials, QoS, TlsMaterial, Transport, TransportEvent,
};

/// Protocol version sent in the connect username.
const API_VERSION: &str = "2019-03-31";

/// Cadence of assignment-status polls while waiting.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("provisioning timed out")]
    Timeout,

    #[error("provisioning cancelled")]
    Cancelled,

    #[error("failed to connect to provisioning service: {0}")]
    Connect(String),

    #[error("failed to send registration request")]
    Registration,

    #[error("registration rejected with status: {0}")]
    Rejected(String),

    #[error("assignment response missing required fields")]
    IncompleteAssignment,

    #[error("malformed provisioning response: {0}")]
    Response(#[from] serde_json::Error),
}

/// Successful provisioning outcome: where to attach and as whom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub hub: String,
    pub device_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Connecting,
    Registering,
    WaitingForAssignment,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    status: String,
    operation_id: Option<String>,
    assigned_hub: Option<String>,
    device_id: Option<String>,
}

pub struct Provisioner {
    transport: Box<dyn Transport>,
    phase: Phase,
    registration_id: String,
    timeout: Duration,
    started_at: Instant,
    last_poll: Instant,
    operation_id: Option<String>,
    outcome: Option<Result<Assignment, ProvisioningError>>,
    delivered: bool,
}

impl Provisioner {
    /// Starts provisioning immediately: initiates the transport connect
    /// and begins the deadline clock.
    pub fn start(
        mut transport: Box<dyn Transport>,
        config: &ProvisioningConfig,
        now: Instant,
    ) -> Self {
        let username = format!(
            "{}/registrations/{}/api-version={API_VERSION}",
            config.id_scope, config.registration_id
        );

        info!(
            registration_id = %config.registration_id,
            id_scope = %config.id_scope,
            endpoint = %config.endpoint,
            "starting provisioning"
        );

        let accepted = transport.connect(ConnectOptions {
            host: config.endpoint.clone(),
            port: config.port,
            client_id: config.registration_id.clone(),
            username: Some(username),
            credentials: Credentials::Tls(TlsMaterial {
                cert_path: config.cert_path.clone(),
                key_path: config.key_path.clone(),
                trust_anchor_path: config.trust_anchor_path.clone(),
                verify_server: config.verify_server,
            }),
        });

        let mut provisioner = Self {
            transport,
            phase: Phase::Connecting,
            registration_id: config.registration_id.clone(),
            timeout: config.timeout(),
            started_at: now,
            last_poll: now,
            operation_id: None,
            outcome: None,
            delivered: false,
        };

        if !accepted {
            provisioner.fail(ProvisioningError::Connect(
                "connect attempt rejected".to_string(),
            ));
        }

        provisioner
    }

    /// Drives the conversation. Returns the outcome exactly once; `None`
    /// before completion and after delivery.
    pub fn tick(&mut self, now: Instant) -> Option<Result<Assignment, ProvisioningError>> {
        if self.delivered {
            return None;
        }

        if !self.terminal() {
            for event in self.transport.pump() {
                match event {
                    TransportEvent::Connected => self.on_connected(),
                    TransportEvent::Disconnected { reason } => {
                        self.fail(ProvisioningError::Connect(reason));
                    }
                    TransportEvent::Message(message) => {
                        if message.topic.starts_with(topic::PROVISIONING_RESPONSE_PREFIX) {
                            self.on_response(&message.payload);
                        }
                    }
                }
                if self.terminal() {
                    break;
                }
            }
        }

        // deadline applies independently of state
        if !self.terminal() && now.duration_since(self.started_at) > self.timeout {
            self.fail(ProvisioningError::Timeout);
        }

        if self.phase == Phase::WaitingForAssignment
            && now.duration_since(self.last_poll) >= POLL_INTERVAL
        {
            self.poll_assignment_status();
            self.last_poll = now;
        }

        if self.terminal() {
            self.delivered = true;
            return self.outcome.take();
        }
        None
    }

    /// Cancels an in-flight conversation; the next tick reports failure.
    pub fn cancel(&mut self) {
        if !self.terminal() {
            self.fail(ProvisioningError::Cancelled);
        }
    }

    fn terminal(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::Failed)
    }

    fn on_connected(&mut self) {
        if self.phase != Phase::Connecting {
            return;
        }

        self.transport
            .subscribe(topic::PROVISIONING_RESPONSE_FILTER, QoS::AtLeastOnce);

        let payload = json!({ "registrationId": self.registration_id }).to_string();
        let sent = self.transport.publish(
            topic::REGISTRATION_PUT,
            payload.as_bytes(),
            QoS::AtLeastOnce,
            false,
        );

        if sent {
            debug!(registration_id = %self.registration_id, "sent registration request");
            self.phase = Phase::Registering;
        } else {
            self.fail(ProvisioningError::Registration);
        }
    }

    fn on_response(&mut self, payload: &[u8]) {
        if !matches!(self.phase, Phase::Registering | Phase::WaitingForAssignment) {
            return;
        }

        let response: RegistrationResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(err) => {
                self.fail(ProvisioningError::Response(err));
                return;
            }
        };

        match response.status.as_str() {
            "assigning" => {
                if let Some(operation_id) = response.operation_id {
                    debug!(operation_id = %operation_id, "assignment in progress");
                    self.operation_id = Some(operation_id);
                } else {
                    warn!("assigning response without operation id, keeping previous");
                }
                self.phase = Phase::WaitingForAssignment;
            }
            "assigned" => match (response.assigned_hub, response.device_id) {
                (Some(hub), Some(device_id)) => {
                    info!(hub = %hub, device_id = %device_id, "provisioned");
                    self.complete(Assignment { hub, device_id });
                }
                _ => self.fail(ProvisioningError::IncompleteAssignment),
            },
            other => self.fail(ProvisioningError::Rejected(other.to_string())),
        }
    }

    fn poll_assignment_status(&mut self) {
        let Some(operation_id) = &self.operation_id else {
            return;
        };
        let poll_topic = topic::registration_status_get(operation_id);
        self.transport
            .publish(&poll_topic, b"", QoS::AtLeastOnce, false);
    }

    fn complete(&mut self, assignment: Assignment) {
        self.phase = Phase::Completed;
        self.transport.disconnect();
        self.outcome = Some(Ok(assignment));
    }

    fn fail(&mut self, error: ProvisioningError) {
        warn!("provisioning failed: {error}");
        self.phase = Phase::Failed;
        self.transport.disconnect();
        self.outcome = Some(Err(error));
    }
}
