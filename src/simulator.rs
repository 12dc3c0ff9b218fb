/*
The device engine.

Owns the connection orchestrator, the twin adapter, the telemetry pipeline
and the device state machine, and glues them to the synthesized vehicle:
battery drain, dead-reckoned movement with heading wander, scripted route
following, geofence membership and speed-limit sampling. A driver calls
`tick()` at a steady cadence (typically 1 Hz); everything else falls out of
that.
*/

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::battery::BatteryModel;
use crate::clock::Clock;
use crate::config::Config;
use crate::event::{EventKind, Extras, Location, Network};
use crate::geo;
use crate::link::{ConnectError, ConnectionState, DeviceConfig, LegacyAccess, Uplink, UplinkEvent};
use crate::policy::{AdaptiveReporting, ExponentialBackoff};
use crate::provisioning::Assignment;
use crate::rng::Rng;
use crate::state::{DeviceState, DomainEvent, StateMachine};
use crate::storage::{FsStorage, Storage};
use crate::telemetry::{Pipeline, Snapshot};
use crate::token::{self, TokenConfig, TokenError};
use crate::transport::{Message, TransportFactory};
use crate::twin::{TwinAdapter, TwinEvent};

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("failed to mint access token: {0}")]
    Token(#[from] TokenError),
}

pub struct Simulator {
    config: Config,
    clock: Box<dyn Clock>,
    rng: Box<dyn Rng>,

    link: Uplink,
    twin: Option<TwinAdapter>,
    twin_storage: Option<Box<dyn Storage>>,
    pipeline: Pipeline,
    machine: StateMachine,
    battery: BatteryModel,

    location: Location,
    speed_kph: f64,
    heading: f64,
    network: Network,
    speed_limit_kph: f64,

    route_progress: f64,
    following_route: bool,
    drive_until: Option<Instant>,

    running: bool,
    attached: bool,
    last_tick: Option<Instant>,
}

impl Simulator {
    pub fn new(
        config: Config,
        clock: Box<dyn Clock>,
        rng: Box<dyn Rng>,
        factory: Box<dyn TransportFactory>,
    ) -> Self {
        let reporting = AdaptiveReporting {
            stationary: Duration::from_secs(config.simulation.heartbeat_stationary_secs),
            moving: Duration::from_secs(config.simulation.heartbeat_moving_secs),
            ..Default::default()
        };
        let pipeline = Pipeline::new(
            config.simulation.device_id.clone(),
            ExponentialBackoff::default(),
            reporting,
        );

        Self {
            location: config.simulation.start_location,
            speed_limit_kph: config.simulation.speed_limit_kph,
            config,
            clock,
            rng,
            link: Uplink::new(factory),
            twin: None,
            twin_storage: None,
            pipeline,
            machine: StateMachine::new(),
            battery: BatteryModel::new(),
            speed_kph: 0.0,
            heading: 0.0,
            network: Network {
                rssi: -72,
                rat: "LTE".to_string(),
            },
            route_progress: 0.0,
            following_route: false,
            drive_until: None,
            running: false,
            attached: false,
            last_tick: None,
        }
    }

    /// Replaces the twin adapter's storage backend (tests).
    pub fn with_twin_storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.twin_storage = Some(storage);
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn device_state(&self) -> DeviceState {
        self.machine.state()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.link.device_id()
    }

    pub fn config_version(&self) -> Option<&str> {
        self.twin.as_ref().map(|twin| twin.config_version())
    }

    pub fn sequence(&self) -> u64 {
        self.pipeline.sequence()
    }

    pub fn queued(&self) -> usize {
        self.pipeline.queue_len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begins the connection lifecycle: provisioning when configured, the
    /// legacy shared-key path otherwise.
    pub fn start(&mut self) -> Result<(), SimulatorError> {
        if self.running {
            return Ok(());
        }

        let mut device = DeviceConfig {
            provisioning: self.config.provisioning.clone(),
            legacy: None,
        };
        if device.provisioning.is_none() {
            if let Some(legacy) = &self.config.legacy {
                let now_unix = self.clock.wall().timestamp().max(0) as u64;
                let sas_token = token::generate(
                    &TokenConfig {
                        host: legacy.hub_host.clone(),
                        device_id: legacy.device_id.clone(),
                        device_key_base64: legacy.device_key_base64.clone(),
                        expiry_seconds: legacy.token_expiry_secs,
                    },
                    now_unix,
                )?;
                device.legacy = Some(LegacyAccess::new(legacy, sas_token));
            }
        }

        self.link.connect(device, self.clock.now())?;
        self.running = true;
        self.last_tick = None;
        Ok(())
    }

    /// Stops the engine and tears the session down.
    pub fn stop(&mut self) {
        self.running = false;
        self.attached = false;
        self.twin = None;
        self.link.disconnect();
    }

    /// One simulation frame. Bounded: transport pump, a finite batch of
    /// lifecycle events, and at most one queued-delivery attempt.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }

        let now = self.clock.now();
        let delta = self
            .last_tick
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        for event in self.link.tick(now) {
            self.on_uplink_event(event, now);
        }

        let driving = self.machine.state() == DeviceState::Driving;
        self.battery.tick(self.rng.as_mut(), delta, driving);
        if let Some(event) = self.machine.battery_percent(self.battery.percent(), now) {
            self.emit(event, now);
        }

        self.update_location(delta);
        self.check_geofences(now);
        if let Some(event) = self.machine.speed_sample(self.speed_kph, self.speed_limit_kph) {
            self.emit(event, now);
        }

        self.machine.tick(now);

        if let Some(until) = self.drive_until {
            if now >= until {
                self.drive_until = None;
                self.following_route = false;
                self.set_speed(0.0);
                self.set_ignition(false);
            }
        }

        if self.attached {
            let snapshot = self.snapshot();
            let Self {
                link,
                pipeline,
                clock,
                ..
            } = self;
            pipeline.tick(link, clock.as_ref(), &snapshot, now);
        }

        if let Some(twin) = &mut self.twin {
            for event in twin.tick(now) {
                Self::log_twin_event(&event);
            }
        }
    }

    /// Ignition input from the scenario or operator.
    pub fn set_ignition(&mut self, on: bool) {
        let now = self.clock.now();
        if let Some(event) = self.machine.ignition(on, now) {
            self.emit(event, now);
        }
    }

    /// Speed input; drives motion edges and speed-limit sampling.
    pub fn set_speed(&mut self, speed_kph: f64) {
        let now = self.clock.now();
        let was_moving = self.speed_kph > 0.0;
        let is_moving = speed_kph > 0.0;
        self.speed_kph = speed_kph.max(0.0);

        if was_moving != is_moving {
            if let Some(event) = self.machine.motion(is_moving, now) {
                self.emit(event, now);
            }
        }

        if let Some(event) = self.machine.speed_sample(self.speed_kph, self.speed_limit_kph) {
            self.emit(event, now);
        }
    }

    /// Battery override for scenarios.
    pub fn set_battery_percent(&mut self, percent: f64) {
        let now = self.clock.now();
        self.battery.set_percent(percent);
        if let Some(event) = self.machine.battery_percent(self.battery.percent(), now) {
            self.emit(event, now);
        }
    }

    /// Scripted driving session: ignition on, a randomized cruising speed,
    /// and route following when waypoints are configured.
    pub fn start_driving(&mut self, minutes: f64) {
        self.set_ignition(true);
        let cruise = 45.0 + self.rng.uniform(-15.0, 15.0);
        self.set_speed(cruise);

        self.drive_until = Some(self.clock.now() + Duration::from_secs_f64(minutes * 60.0));
        if !self.config.route.is_empty() {
            self.following_route = true;
            self.route_progress = 0.0;
        }

        info!(speed_kph = cruise, minutes, "driving session started");
    }

    /// Burst of random events for load scenarios.
    pub fn generate_spike(&mut self, count: usize) {
        const KINDS: [EventKind; 5] = [
            EventKind::MotionStart,
            EventKind::MotionStop,
            EventKind::IgnitionOn,
            EventKind::IgnitionOff,
            EventKind::Heartbeat,
        ];

        let now = self.clock.now();
        for _ in 0..count {
            let index = self.rng.uniform_int(0, KINDS.len() as i64 - 1) as usize;
            self.emit(
                DomainEvent {
                    kind: KINDS[index],
                    extras: Extras::new(),
                },
                now,
            );
        }
    }

    fn on_uplink_event(&mut self, event: UplinkEvent, now: Instant) {
        match event {
            UplinkEvent::Connected(assignment) => self.on_attached(assignment, now),
            UplinkEvent::Reconnected => {
                self.machine.set_connected(true, now);
                // re-sync desired configuration after the outage
                if let Some(twin) = &mut self.twin {
                    if let Err(err) = twin.request_twin(&mut self.link, now) {
                        warn!("twin re-sync request failed: {err}");
                    }
                }
            }
            UplinkEvent::ConnectionLost { reason } => {
                warn!(reason = %reason, "uplink lost, queueing telemetry");
                self.machine.set_connected(false, now);
            }
            UplinkEvent::Failed(message) => {
                error!("uplink failed: {message}");
                self.machine.set_connected(false, now);
            }
            UplinkEvent::Twin(message) => {
                if let Some(twin) = &mut self.twin {
                    let event = twin.handle_message(&mut self.link, &message, self.clock.as_ref(), now);
                    if let Some(event) = event {
                        self.on_twin_event(event);
                    }
                }
            }
            UplinkEvent::Command(message) => self.on_command(&message),
        }
    }

    fn on_attached(&mut self, assignment: Assignment, now: Instant) {
        info!(hub = %assignment.hub, device_id = %assignment.device_id, "device attached");
        self.machine.set_connected(true, now);
        self.pipeline.set_device_id(assignment.device_id.clone());
        self.attached = true;

        let storage = self.twin_storage.take().unwrap_or_else(|| {
            Box::new(FsStorage::new(self.config.twin.error_path.clone()))
        });
        let mut twin = TwinAdapter::new(
            assignment.device_id,
            self.config.twin.config_path.clone(),
            storage,
        );

        if twin.initialize(&mut self.link) {
            if let Err(err) = twin.request_twin(&mut self.link, now) {
                warn!("initial twin request failed: {err}");
            }
        } else {
            warn!("twin subscriptions could not be established");
        }
        self.twin = Some(twin);
    }

    fn on_twin_event(&mut self, event: TwinEvent) {
        Self::log_twin_event(&event);
        if let TwinEvent::ConfigApplied { config, .. } = &event {
            let interval = config
                .get("config")
                .and_then(|c| c.get("reporting_interval_sec"))
                .or_else(|| config.get("reporting_interval_sec"))
                .and_then(serde_json::Value::as_u64);
            if let Some(secs) = interval {
                info!(secs, "retuning heartbeat from twin configuration");
                self.pipeline
                    .set_stationary_heartbeat(Duration::from_secs(secs));
            }
        }
    }

    fn log_twin_event(event: &TwinEvent) {
        match event {
            TwinEvent::ConfigApplied {
                version,
                has_changes,
                ..
            } => info!(version = %version, changed = has_changes, "twin configuration event"),
            TwinEvent::Acknowledged => debug!("reported properties acknowledged"),
            TwinEvent::Error(err) => warn!("twin error: {err}"),
        }
    }

    /// Cloud-to-device commands: `{"cmd": "...", "value": ...}`.
    fn on_command(&mut self, message: &Message) {
        let payload: serde_json::Value = match serde_json::from_slice(&message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic = %message.topic, "ignoring malformed command: {err}");
                return;
            }
        };

        match payload.get("cmd").and_then(serde_json::Value::as_str) {
            Some("setHeartbeatSeconds") => {
                if let Some(secs) = payload.get("value").and_then(serde_json::Value::as_u64) {
                    info!(secs, "heartbeat interval updated by command");
                    self.pipeline
                        .set_stationary_heartbeat(Duration::from_secs(secs));
                }
            }
            Some("setSpeedLimit") => {
                if let Some(limit) = payload.get("value").and_then(serde_json::Value::as_f64) {
                    info!(limit, "speed limit updated by command");
                    self.speed_limit_kph = limit;
                }
            }
            Some("reboot") => {
                info!("reboot requested");
                self.stop();
                if let Err(err) = self.start() {
                    error!("restart after reboot failed: {err}");
                }
            }
            Some(other) => debug!(cmd = %other, "ignoring unknown command"),
            None => debug!(topic = %message.topic, "device-bound message without a command"),
        }
    }

    fn emit(&mut self, event: DomainEvent, now: Instant) {
        if !self.attached {
            // no confirmed identity yet
            debug!(kind = %event.kind, "dropping event raised before first attachment");
            return;
        }

        let snapshot = self.snapshot();
        let Self {
            link,
            pipeline,
            clock,
            ..
        } = self;
        pipeline.emit(link, clock.as_ref(), &snapshot, event, now);
    }

    fn snapshot(&mut self) -> Snapshot {
        Snapshot {
            location: self.location,
            speed_kph: self.speed_kph,
            heading: self.heading,
            battery: self.battery.info(self.rng.as_mut()),
            network: self.network.clone(),
        }
    }

    fn update_location(&mut self, delta_seconds: f64) {
        if self.following_route && !self.config.route.is_empty() {
            // progress is normalized over a nominal one-kilometer route
            let speed_ms = self.speed_kph / 3.6;
            self.route_progress += (speed_ms * delta_seconds) / 1000.0;

            if self.route_progress >= 1.0 {
                self.route_progress = 1.0;
                self.following_route = false;
                self.set_speed(0.0);
            }

            if let Some(position) = geo::interpolate_route(&self.config.route, self.route_progress)
            {
                self.location = Location {
                    alt: self.location.alt,
                    accuracy: self.location.accuracy,
                    ..position
                };
            }
        } else if self.speed_kph > 0.0 {
            // free movement with a wandering heading
            self.heading = (self.heading + self.rng.normal(0.0, 5.0)).rem_euclid(360.0);
            let distance = (self.speed_kph / 3.6) * delta_seconds;
            self.location = geo::move_location(self.location, self.heading, distance);
        }
    }

    fn check_geofences(&mut self, now: Instant) {
        if self.config.geofences.is_empty() {
            return;
        }

        let membership: Vec<(String, bool)> = self
            .config
            .geofences
            .iter()
            .map(|fence| (fence.id.clone(), geo::is_inside(&self.location, fence)))
            .collect();

        for (id, inside) in membership {
            if let Some(event) = self.machine.geofence(inside, &id) {
                self.emit(event, now);
            }
        }
    }
}
