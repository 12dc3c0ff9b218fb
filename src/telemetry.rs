/*
The telemetry pipeline.

Enriches domain events into full envelopes (identity, timestamp, sequence,
current readings), serializes them, and delivers with at-least-once
semantics: an envelope the transport rejects, or raised while offline, is
queued in a bounded FIFO and retried head-of-line so per-topic order is
preserved. Periodic heartbeats are paced here, shorter while in motion.
*/

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::event::{Battery, Event, EventKind, Location, Network};
use crate::link::Publish;
use crate::policy::{AdaptiveReporting, ExponentialBackoff, ReportingPolicy, RetryPolicy};
use crate::state::DomainEvent;
use crate::topic;
use crate::transport::QoS;

/// Bound on the offline queue; the oldest envelope is dropped when full.
pub const QUEUE_CAPACITY: usize = 100;

/// Current readings attached to every envelope.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub location: Location,
    pub speed_kph: f64,
    pub heading: f64,
    pub battery: Battery,
    pub network: Network,
}

struct QueuedMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retained: bool,
    attempts: u32,
    next_retry_at: Instant,
}

pub struct Pipeline {
    device_id: String,
    sequence: u64,
    queue: VecDeque<QueuedMessage>,
    capacity: usize,
    retry: ExponentialBackoff,
    reporting: AdaptiveReporting,
    last_heartbeat: Option<Instant>,
    last_reported_battery_pct: f64,
    in_motion: bool,
    dropped: u64,
}

impl Pipeline {
    pub fn new(
        device_id: impl Into<String>,
        retry: ExponentialBackoff,
        reporting: AdaptiveReporting,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sequence: 0,
            queue: VecDeque::new(),
            capacity: QUEUE_CAPACITY,
            retry,
            reporting,
            last_heartbeat: None,
            last_reported_battery_pct: 100.0,
            in_motion: false,
            dropped: 0,
        }
    }

    /// Last assigned sequence number; envelopes count from 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Envelopes discarded because the queue overflowed or the retry
    /// budget ran out.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Adopts the identity assigned by provisioning.
    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.device_id = device_id.into();
    }

    /// Retunes the stationary heartbeat cadence (commands and twin config).
    pub fn set_stationary_heartbeat(&mut self, interval: std::time::Duration) {
        self.reporting.stationary = interval;
    }

    /// Assembles, serializes and dispatches one domain event.
    pub fn emit(
        &mut self,
        link: &mut dyn Publish,
        clock: &dyn Clock,
        snapshot: &Snapshot,
        event: DomainEvent,
        now: Instant,
    ) {
        match event.kind {
            EventKind::MotionStart => self.in_motion = true,
            EventKind::MotionStop => self.in_motion = false,
            _ => {}
        }

        if !self.should_report(&event, snapshot) {
            debug!(kind = %event.kind, "event suppressed by reporting policy");
            return;
        }
        if event.kind == EventKind::LowBattery {
            self.last_reported_battery_pct = snapshot.battery.percent;
        }

        self.sequence += 1;
        let envelope = Event {
            device_id: self.device_id.clone(),
            timestamp: clock.iso8601(),
            event_type: event.kind,
            sequence: self.sequence,
            location: snapshot.location,
            speed_kph: snapshot.speed_kph,
            heading: snapshot.heading,
            battery: snapshot.battery,
            network: snapshot.network.clone(),
            extras: event.extras,
        };

        let payload = match crate::event::encode(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                // never panics the engine; the envelope is lost but counted
                warn!(kind = %envelope.event_type, "failed to serialize event: {err}");
                self.dropped += 1;
                return;
            }
        };

        let event_topic = topic::telemetry(&self.device_id);
        self.dispatch(link, event_topic, payload, now);
    }

    /// Heartbeat pacing and the head-of-line retry pass. At most one
    /// delivery attempt per tick keeps tick latency bounded.
    pub fn tick(
        &mut self,
        link: &mut dyn Publish,
        clock: &dyn Clock,
        snapshot: &Snapshot,
        now: Instant,
    ) {
        let interval = self.reporting.heartbeat_interval(self.in_motion);
        let due = match self.last_heartbeat {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        };
        if due {
            self.last_heartbeat = Some(now);
            self.emit(
                link,
                clock,
                snapshot,
                DomainEvent {
                    kind: EventKind::Heartbeat,
                    extras: Default::default(),
                },
                now,
            );
        }

        self.retry_head(link, now);
    }

    fn should_report(&self, event: &DomainEvent, snapshot: &Snapshot) -> bool {
        match event.kind {
            EventKind::Heartbeat => true,
            EventKind::MotionStart | EventKind::MotionStop => {
                self.reporting.report_motion_change()
            }
            EventKind::LowBattery => self
                .reporting
                .report_battery_level(snapshot.battery.percent, self.last_reported_battery_pct),
            _ => true,
        }
    }

    fn dispatch(&mut self, link: &mut dyn Publish, topic: String, payload: Vec<u8>, now: Instant) {
        // a backlog means earlier envelopes are still owed; queue behind
        // them to preserve per-topic order
        if self.queue.is_empty() && link.is_connected() {
            if link.publish(&topic, &payload, QoS::AtLeastOnce, false) {
                trace!(topic = %topic, seq = self.sequence, "published");
                return;
            }
            // the transport rejected the attempt
            self.enqueue(QueuedMessage {
                topic,
                payload,
                qos: QoS::AtLeastOnce,
                retained: false,
                attempts: 1,
                next_retry_at: now + self.retry.backoff(1),
            });
            return;
        }

        // offline or behind a backlog: no attempt made yet
        self.enqueue(QueuedMessage {
            topic,
            payload,
            qos: QoS::AtLeastOnce,
            retained: false,
            attempts: 0,
            next_retry_at: now,
        });
    }

    fn enqueue(&mut self, message: QueuedMessage) {
        if self.queue.len() >= self.capacity {
            // bounded queue: drop-oldest keeps the most recent telemetry
            self.queue.pop_front();
            self.dropped += 1;
            warn!(capacity = self.capacity, "offline queue full, dropped oldest envelope");
        }
        debug!(topic = %message.topic, queued = self.queue.len() + 1, "envelope queued for retry");
        self.queue.push_back(message);
    }

    fn retry_head(&mut self, link: &mut dyn Publish, now: Instant) {
        if !link.is_connected() {
            return;
        }

        // shed envelopes whose retry budget ran out
        while let Some(head) = self.queue.front() {
            if now < head.next_retry_at {
                return;
            }
            if self.retry.should_retry(head.attempts) {
                break;
            }
            let head = self.queue.pop_front().expect("front checked above");
            self.dropped += 1;
            warn!(
                topic = %head.topic,
                attempts = head.attempts,
                "dropping envelope after retry budget exhausted"
            );
        }

        // single head-of-line attempt preserves per-topic order
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if link.publish(&head.topic, &head.payload, head.qos, head.retained) {
            trace!(topic = %head.topic, "queued envelope delivered");
            self.queue.pop_front();
        } else {
            head.attempts += 1;
            head.next_retry_at = now + self.retry.backoff(head.attempts);
        }
    }
}
