/*
The twin protocol adapter.

Implements the desired/reported configuration conversation on the twin
control plane: subscribe to the response and desired-patch topics, issue a
GET for the initial sync, apply desired properties (strip `$` metadata,
extract the version, replace the applied snapshot atomically iff the
version changed), and acknowledge with a reported PATCH. Requests are
correlated by `$rid` in a small bounded table with a deadline.

Malformed inbound payloads never crash the adapter: they are persisted as
diagnostic records through the storage port and surfaced as errors.
*/

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::link::Publish;
use crate::storage::Storage;
use crate::topic;
use crate::transport::{Message, QoS};

/// How long a GET or reported PATCH may wait for its response.
pub const CORRELATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on in-flight correlated requests.
const MAX_PENDING: usize = 8;

/// Property groups acknowledged individually when the desired document has
/// no `config` sub-object.
const ACK_GROUPS: [&str; 3] = ["reporting", "modes", "ota"];

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("twin subscriptions not initialized")]
    NotInitialized,

    #[error("too many twin requests in flight")]
    Saturated,

    #[error("twin request rejected by transport")]
    PublishRejected,

    #[error("twin response timed out (rid {0})")]
    Timeout(String),

    #[error("unexpected twin response: {0}")]
    InvalidResponse(String),

    #[error("failed to parse twin payload: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("failed to persist configuration: {0}")]
    Storage(#[from] std::io::Error),
}

/// Outcome surfaced to the device engine.
#[derive(Debug)]
pub enum TwinEvent {
    /// A desired document was applied (or re-applied with no changes).
    ConfigApplied {
        version: String,
        has_changes: bool,
        config: Value,
    },
    /// A reported PATCH was acknowledged by the service (status 204).
    Acknowledged,
    Error(TwinError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Purpose {
    Get,
    ReportedPatch,
}

struct PendingRequest {
    purpose: Purpose,
    issued_at: Instant,
}

struct ApplyOutcome {
    version: String,
    has_changes: bool,
    applied_at: String,
    config: Value,
}

pub struct TwinAdapter {
    device_id: String,
    config_path: PathBuf,
    storage: Box<dyn Storage>,
    initialized: bool,
    next_rid: u64,
    pending: HashMap<String, PendingRequest>,
    version: String,
    applied: Value,
}

impl TwinAdapter {
    pub fn new(device_id: impl Into<String>, config_path: PathBuf, storage: Box<dyn Storage>) -> Self {
        Self {
            device_id: device_id.into(),
            config_path,
            storage,
            initialized: false,
            next_rid: 1,
            pending: HashMap::new(),
            version: String::new(),
            applied: Value::Null,
        }
    }

    /// Version tag of the currently applied configuration; empty until the
    /// first desired document is applied.
    pub fn config_version(&self) -> &str {
        &self.version
    }

    /// Current applied configuration snapshot.
    pub fn applied(&self) -> &Value {
        &self.applied
    }

    /// Subscribes to the response and desired-patch topics. Must succeed
    /// before any request is issued.
    pub fn initialize(&mut self, link: &mut dyn Publish) -> bool {
        if !link.subscribe(topic::TWIN_RESPONSE_FILTER, QoS::AtMostOnce) {
            warn!("failed to subscribe to twin response topic");
            return false;
        }
        if !link.subscribe(topic::TWIN_DESIRED_FILTER, QoS::AtMostOnce) {
            warn!("failed to subscribe to twin desired topic");
            return false;
        }

        debug!(device_id = %self.device_id, "twin subscriptions established");
        self.initialized = true;
        true
    }

    /// Issues a full-twin GET with a fresh correlation id.
    pub fn request_twin(&mut self, link: &mut dyn Publish, now: Instant) -> Result<(), TwinError> {
        if !self.initialized {
            return Err(TwinError::NotInitialized);
        }
        if self.pending.len() >= MAX_PENDING {
            return Err(TwinError::Saturated);
        }

        let rid = self.fresh_rid();
        let get_topic = topic::twin_get(rid);
        if !link.publish(&get_topic, b"", QoS::AtMostOnce, false) {
            return Err(TwinError::PublishRejected);
        }

        debug!(rid, "requested full twin");
        self.pending.insert(
            rid.to_string(),
            PendingRequest {
                purpose: Purpose::Get,
                issued_at: now,
            },
        );
        Ok(())
    }

    /// Routes an inbound twin control-plane message.
    pub fn handle_message(
        &mut self,
        link: &mut dyn Publish,
        message: &Message,
        clock: &dyn Clock,
        now: Instant,
    ) -> Option<TwinEvent> {
        if message.topic.starts_with(topic::TWIN_RESPONSE_PREFIX) {
            self.on_response(link, message, clock, now)
        } else if message.topic.starts_with(topic::TWIN_DESIRED_PREFIX) {
            self.on_desired_patch(link, message, clock, now)
        } else {
            None
        }
    }

    /// Expires overdue correlation entries.
    pub fn tick(&mut self, now: Instant) -> Vec<TwinEvent> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, request)| now.duration_since(request.issued_at) >= CORRELATION_TIMEOUT)
            .map(|(rid, _)| rid.clone())
            .collect();

        expired
            .into_iter()
            .map(|rid| {
                warn!(rid = %rid, "twin request timed out");
                self.pending.remove(&rid);
                TwinEvent::Error(TwinError::Timeout(rid))
            })
            .collect()
    }

    fn on_response(
        &mut self,
        link: &mut dyn Publish,
        message: &Message,
        clock: &dyn Clock,
        now: Instant,
    ) -> Option<TwinEvent> {
        let rid = topic::request_id(&message.topic).unwrap_or_default().to_string();
        match self.pending.remove(&rid) {
            Some(request) => debug!(rid = %rid, purpose = ?request.purpose, "twin response correlated"),
            None => debug!(rid = %rid, "twin response without a pending request"),
        }

        let status = match topic::response_status(&message.topic) {
            Some(status) => status,
            None => {
                return Some(TwinEvent::Error(TwinError::InvalidResponse(format!(
                    "malformed response topic: {}",
                    message.topic
                ))));
            }
        };

        match status {
            200 => {
                let document: Value = match serde_json::from_slice(&message.payload) {
                    Ok(document) => document,
                    Err(err) => return Some(self.json_failure(message, err, clock)),
                };

                let desired = document
                    .get("desired")
                    .or_else(|| document.get("properties").and_then(|p| p.get("desired")))
                    .cloned();

                match desired {
                    Some(desired) if desired.is_object() => {
                        Some(self.apply_and_report(link, desired, clock, now))
                    }
                    _ => Some(TwinEvent::Error(TwinError::InvalidResponse(
                        "twin document missing desired properties".to_string(),
                    ))),
                }
            }
            204 => Some(TwinEvent::Acknowledged),
            other => Some(TwinEvent::Error(TwinError::InvalidResponse(format!(
                "twin operation failed with status {other}"
            )))),
        }
    }

    fn on_desired_patch(
        &mut self,
        link: &mut dyn Publish,
        message: &Message,
        clock: &dyn Clock,
        now: Instant,
    ) -> Option<TwinEvent> {
        let desired: Value = match serde_json::from_slice(&message.payload) {
            Ok(desired) => desired,
            Err(err) => return Some(self.json_failure(message, err, clock)),
        };
        if !desired.is_object() {
            return Some(TwinEvent::Error(TwinError::InvalidResponse(
                "desired patch is not an object".to_string(),
            )));
        }
        Some(self.apply_and_report(link, desired, clock, now))
    }

    fn apply_and_report(
        &mut self,
        link: &mut dyn Publish,
        desired: Value,
        clock: &dyn Clock,
        now: Instant,
    ) -> TwinEvent {
        let outcome = match self.apply_desired(desired, clock) {
            Ok(outcome) => outcome,
            Err(err) => return TwinEvent::Error(err),
        };

        let ack = build_ack(&outcome, "ok");
        if let Err(err) = self.send_reported(link, ack, now) {
            warn!("failed to send reported acknowledgement: {err}");
            return TwinEvent::Error(err);
        }

        info!(
            version = %outcome.version,
            changed = outcome.has_changes,
            "configuration applied"
        );

        TwinEvent::ConfigApplied {
            version: outcome.version,
            has_changes: outcome.has_changes,
            config: outcome.config,
        }
    }

    /// Applies a desired document: extract the version, strip metadata,
    /// persist, and replace the in-memory snapshot iff the version
    /// changed. On storage failure nothing is replaced and the previous
    /// snapshot stays canonical.
    fn apply_desired(&mut self, desired: Value, clock: &dyn Clock) -> Result<ApplyOutcome, TwinError> {
        let version = extract_version(&desired);
        let has_changes = version != self.version;

        let mut clean = desired;
        if let Some(object) = clean.as_object_mut() {
            object.remove("$version");
            object.remove("$metadata");
        }

        let bytes = serde_json::to_vec_pretty(&clean)?;
        let config_path = self.config_path.clone();
        self.storage.write_atomic(&config_path, &bytes)?;

        if has_changes {
            self.version = version.clone();
            self.applied = clean.clone();
        }

        Ok(ApplyOutcome {
            version,
            has_changes,
            applied_at: clock.iso8601(),
            config: clean,
        })
    }

    fn send_reported(
        &mut self,
        link: &mut dyn Publish,
        ack: Value,
        now: Instant,
    ) -> Result<(), TwinError> {
        if self.pending.len() >= MAX_PENDING {
            return Err(TwinError::Saturated);
        }

        let rid = self.fresh_rid();
        let patch_topic = topic::twin_reported_patch(rid);
        let payload = ack.to_string();
        if !link.publish(&patch_topic, payload.as_bytes(), QoS::AtMostOnce, false) {
            return Err(TwinError::PublishRejected);
        }

        debug!(rid, "sent reported acknowledgement");
        self.pending.insert(
            rid.to_string(),
            PendingRequest {
                purpose: Purpose::ReportedPatch,
                issued_at: now,
            },
        );
        Ok(())
    }

    /// Persists a diagnostic record for a malformed inbound payload; the
    /// adapter keeps running and the applied configuration is untouched.
    fn json_failure(
        &mut self,
        message: &Message,
        err: serde_json::Error,
        clock: &dyn Clock,
    ) -> TwinEvent {
        warn!(topic = %message.topic, "malformed twin payload: {err}");

        let record = json!({
            "timestamp": clock.iso8601(),
            "deviceId": self.device_id,
            "topic": message.topic,
            "error": err.to_string(),
            "rawPayload": message.payload_str(),
        });
        if let Err(storage_err) = self
            .storage
            .write_error_record(record.to_string().as_bytes())
        {
            warn!("failed to persist twin diagnostic record: {storage_err}");
        }

        TwinEvent::Error(TwinError::JsonParse(err))
    }

    fn fresh_rid(&mut self) -> u64 {
        let rid = self.next_rid;
        self.next_rid += 1;
        rid
    }
}

/// Version tag from `$version` or `config.config_version`, else "unknown".
fn extract_version(desired: &Value) -> String {
    let tag = desired.get("$version").or_else(|| {
        desired
            .get("config")
            .and_then(|config| config.get("config_version"))
    });

    match tag {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => "unknown".to_string(),
    }
}

/// Structured acknowledgement mirroring the shape of the applied document.
fn build_ack(outcome: &ApplyOutcome, status: &str) -> Value {
    if let Some(config) = outcome.config.get("config").and_then(Value::as_object) {
        let mut config_ack = serde_json::Map::new();
        config_ack.insert("applied_at".into(), json!(outcome.applied_at));
        config_ack.insert("status".into(), json!(status));
        config_ack.insert("has_changes".into(), json!(outcome.has_changes));
        if outcome.version != "unknown" {
            config_ack.insert("config_version".into(), json!(outcome.version));
        }

        // mirror the acknowledged fields back to the service
        for field in ["reporting_interval_sec", "feature_high_rate"] {
            if let Some(value) = config.get(field) {
                config_ack.insert(field.into(), value.clone());
            }
        }

        return json!({ "config": config_ack });
    }

    let mut ack = serde_json::Map::new();
    ack.insert("applied_at".into(), json!(outcome.applied_at));
    ack.insert("status".into(), json!(status));
    ack.insert("has_changes".into(), json!(outcome.has_changes));
    ack.insert("config_version".into(), json!(outcome.version));

    for group in ACK_GROUPS {
        if outcome.config.get(group).is_some() {
            ack.insert(
                format!("{group}_ack"),
                json!({
                    "applied_at": outcome.applied_at,
                    "status": status,
                }),
            );
        }
    }

    Value::Object(ack)
}
